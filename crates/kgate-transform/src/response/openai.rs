use bytes::Bytes;
use kgate_protocol::ReasoningMode;
use kgate_protocol::openai::chat::{
    ChatCompletionChoice, ChatCompletionChunkObjectType, ChatCompletionFinishReason,
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCallChunk,
    ChatCompletionMessageToolCallChunkFunction, ChatCompletionMessageToolCallFunction,
    ChatCompletionObjectType, ChatCompletionResponseMessage, ChatCompletionRole,
    ChatCompletionStreamChoice, ChatCompletionStreamResponseDelta,
    ChatCompletionToolCallChunkType, CompletionUsage, CreateChatCompletionResponse,
    CreateChatCompletionStreamResponse, OpenAIErrorBody, OpenAIErrorResponse,
};
use kgate_protocol::sse::{DONE_FRAME, data_frame};

use crate::reasoning::render_complete;
use crate::response::{FinishReason, Reply, ReplyEvent, StreamEncoder, TokenUsage, push_frame};

pub fn map_finish_reason(reason: FinishReason) -> ChatCompletionFinishReason {
    match reason {
        FinishReason::Stop => ChatCompletionFinishReason::Stop,
        FinishReason::Length => ChatCompletionFinishReason::Length,
        FinishReason::ToolCalls => ChatCompletionFinishReason::ToolCalls,
    }
}

pub fn map_usage(usage: TokenUsage) -> CompletionUsage {
    CompletionUsage {
        prompt_tokens: i64::from(usage.prompt_tokens),
        completion_tokens: i64::from(usage.completion_tokens),
        total_tokens: i64::from(usage.total()),
    }
}

pub fn openai_error(code: &str, message: &str) -> OpenAIErrorResponse {
    OpenAIErrorResponse {
        error: OpenAIErrorBody {
            message: message.to_string(),
            r#type: code.to_string(),
            code: Some(code.to_string()),
        },
    }
}

/// Encodes reply events as `chat.completion.chunk` frames.
#[derive(Debug, Clone)]
pub struct OpenAIChatStreamEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    finished: bool,
}

impl OpenAIChatStreamEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            role_sent: false,
            finished: false,
        }
    }

    fn chunk(
        &self,
        delta: ChatCompletionStreamResponseDelta,
        finish_reason: Option<ChatCompletionFinishReason>,
        usage: Option<CompletionUsage>,
    ) -> CreateChatCompletionStreamResponse {
        CreateChatCompletionStreamResponse {
            id: self.id.clone(),
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatCompletionStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }

    fn push(&self, frames: &mut Vec<Bytes>, chunk: CreateChatCompletionStreamResponse) {
        push_frame(frames, data_frame(&chunk));
    }

    fn ensure_role(&mut self, frames: &mut Vec<Bytes>) {
        if self.role_sent {
            return;
        }
        self.role_sent = true;
        let chunk = self.chunk(
            ChatCompletionStreamResponseDelta {
                role: Some(ChatCompletionRole::Assistant),
                content: Some(String::new()),
                ..Default::default()
            },
            None,
            None,
        );
        self.push(frames, chunk);
    }
}

fn tool_chunk(
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
) -> ChatCompletionStreamResponseDelta {
    ChatCompletionStreamResponseDelta {
        tool_calls: Some(vec![ChatCompletionMessageToolCallChunk {
            index: index as i64,
            r#type: id.as_ref().map(|_| ChatCompletionToolCallChunkType::Function),
            id,
            function: Some(ChatCompletionMessageToolCallChunkFunction {
                name,
                arguments: Some(arguments),
            }),
        }]),
        ..Default::default()
    }
}

impl StreamEncoder for OpenAIChatStreamEncoder {
    fn encode(&mut self, event: ReplyEvent) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.ensure_role(&mut frames);
        let chunk = match event {
            ReplyEvent::Text(text) => self.chunk(
                ChatCompletionStreamResponseDelta {
                    content: Some(text),
                    ..Default::default()
                },
                None,
                None,
            ),
            ReplyEvent::Reasoning(text) => self.chunk(
                ChatCompletionStreamResponseDelta {
                    reasoning_content: Some(text),
                    ..Default::default()
                },
                None,
                None,
            ),
            ReplyEvent::ToolCallStart { index, id, name } => self.chunk(
                tool_chunk(index, Some(id), Some(name), String::new()),
                None,
                None,
            ),
            ReplyEvent::ToolCallArguments { index, fragment } => {
                self.chunk(tool_chunk(index, None, None, fragment), None, None)
            }
            ReplyEvent::Finish { reason, usage } => {
                self.finished = true;
                let chunk = self.chunk(
                    ChatCompletionStreamResponseDelta::default(),
                    Some(map_finish_reason(reason)),
                    Some(map_usage(usage)),
                );
                self.push(&mut frames, chunk);
                frames.push(Bytes::from_static(DONE_FRAME));
                return frames;
            }
        };
        self.push(&mut frames, chunk);
        frames
    }

    fn encode_error(&mut self, code: &str, message: &str) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.finished = true;
        push_frame(&mut frames, data_frame(&openai_error(code, message)));
        frames.push(Bytes::from_static(DONE_FRAME));
        frames
    }
}

pub fn build_openai_response(
    id: &str,
    model: &str,
    created: i64,
    reply: Reply,
    mode: ReasoningMode,
) -> CreateChatCompletionResponse {
    let (reasoning_content, content) = render_complete(mode, &reply.reasoning, &reply.content);
    let tool_calls = (!reply.tool_calls.is_empty()).then(|| {
        reply
            .tool_calls
            .into_iter()
            .map(|call| ChatCompletionMessageToolCall::Function {
                id: call.id,
                function: ChatCompletionMessageToolCallFunction {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect()
    });
    let content = if content.is_empty() && tool_calls.is_some() {
        None
    } else {
        Some(content)
    };

    CreateChatCompletionResponse {
        id: id.to_string(),
        object: ChatCompletionObjectType::ChatCompletion,
        created,
        model: model.to_string(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatCompletionResponseMessage {
                role: ChatCompletionRole::Assistant,
                content,
                reasoning_content,
                tool_calls,
            },
            finish_reason: map_finish_reason(reply.finish),
        }],
        usage: Some(map_usage(reply.usage)),
    }
}
