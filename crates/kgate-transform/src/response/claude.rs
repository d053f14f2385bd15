use bytes::Bytes;
use kgate_protocol::ReasoningMode;
use kgate_protocol::claude::error::{ErrorDetail, ErrorResponse, ErrorResponseType, ErrorType};
use kgate_protocol::claude::messages::{
    ContentBlock, Message, MessageRole, MessageType, StopReason, StreamContentBlock,
    StreamContentBlockDelta, StreamEvent, StreamMessage, Usage,
};
use kgate_protocol::claude::messages::stream::{StreamMessageDelta, StreamUsage};
use kgate_protocol::sse::named_frame;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::response::{FinishReason, Reply, ReplyEvent, StreamEncoder, push_frame};

pub fn map_stop_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
    }
}

/// Error type for a gateway error code.
pub fn error_type_for(code: &str) -> ErrorType {
    match code {
        "validation_error" => ErrorType::InvalidRequestError,
        "auth_error" | "invalid_api_key" => ErrorType::AuthenticationError,
        "account_disabled" => ErrorType::PermissionError,
        "quota_error" | "rate_limited" => ErrorType::RateLimitError,
        "pool_exhausted" => ErrorType::OverloadedError,
        "model_not_found" => ErrorType::NotFoundError,
        _ => ErrorType::ApiError,
    }
}

pub fn claude_error(code: &str, message: &str) -> ErrorResponse {
    ErrorResponse {
        r#type: ErrorResponseType::Error,
        error: ErrorDetail {
            r#type: error_type_for(code),
            message: message.to_string(),
        },
    }
}

/// Placeholder signature for thinking blocks; the upstream does not sign them.
pub fn thinking_signature() -> String {
    format!("sig_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Tool(usize),
}

/// Encodes reply events as named Anthropic message stream events.
#[derive(Debug, Clone)]
pub struct ClaudeStreamEncoder {
    id: String,
    model: String,
    input_tokens: u32,
    started: bool,
    finished: bool,
    next_block_index: u32,
    open_block: Option<(u32, BlockKind)>,
}

impl ClaudeStreamEncoder {
    /// `input_tokens` is the prompt estimate announced in `message_start`.
    pub fn new(id: impl Into<String>, model: impl Into<String>, input_tokens: u32) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            input_tokens,
            started: false,
            finished: false,
            next_block_index: 0,
            open_block: None,
        }
    }

    fn push(frames: &mut Vec<Bytes>, event: StreamEvent) {
        push_frame(frames, named_frame(event.event_name(), &event));
    }

    fn ensure_started(&mut self, frames: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        Self::push(
            frames,
            StreamEvent::MessageStart {
                message: StreamMessage {
                    id: self.id.clone(),
                    r#type: MessageType::Message,
                    role: MessageRole::Assistant,
                    content: Vec::new(),
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: self.input_tokens,
                        output_tokens: 0,
                    },
                },
            },
        );
    }

    fn close_block(&mut self, frames: &mut Vec<Bytes>) {
        if let Some((index, _)) = self.open_block.take() {
            Self::push(frames, StreamEvent::ContentBlockStop { index });
        }
    }

    /// Returns the index of an open block of `kind`, starting one if needed.
    fn block(&mut self, kind: BlockKind, frames: &mut Vec<Bytes>, start: StreamContentBlock) -> u32 {
        if let Some((index, open)) = self.open_block
            && open == kind
        {
            return index;
        }
        self.close_block(frames);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some((index, kind));
        Self::push(
            frames,
            StreamEvent::ContentBlockStart {
                index,
                content_block: start,
            },
        );
        index
    }
}

impl StreamEncoder for ClaudeStreamEncoder {
    fn encode(&mut self, event: ReplyEvent) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.ensure_started(&mut frames);
        match event {
            ReplyEvent::Text(text) => {
                if text.is_empty() {
                    return frames;
                }
                let index = self.block(
                    BlockKind::Text,
                    &mut frames,
                    StreamContentBlock::Text {
                        text: String::new(),
                    },
                );
                Self::push(
                    &mut frames,
                    StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamContentBlockDelta::TextDelta { text },
                    },
                );
            }
            ReplyEvent::Reasoning(thinking) => {
                let index = self.block(
                    BlockKind::Thinking,
                    &mut frames,
                    StreamContentBlock::Thinking {
                        thinking: String::new(),
                        signature: thinking_signature(),
                    },
                );
                Self::push(
                    &mut frames,
                    StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamContentBlockDelta::ThinkingDelta { thinking },
                    },
                );
            }
            ReplyEvent::ToolCallStart { index, id, name } => {
                self.block(
                    BlockKind::Tool(index),
                    &mut frames,
                    StreamContentBlock::ToolUse {
                        id,
                        name,
                        input: JsonValue::Object(Default::default()),
                    },
                );
            }
            ReplyEvent::ToolCallArguments { index, fragment } => {
                let block_index = match self.open_block {
                    Some((block_index, BlockKind::Tool(open))) if open == index => block_index,
                    open_block => {
                        // A tool_use block cannot be reopened once another
                        // block has started, so the fragment has nowhere to go.
                        warn!(
                            event = "tool_arguments_dropped",
                            tool_index = index,
                            open_block = ?open_block,
                            bytes = fragment.len(),
                        );
                        return frames;
                    }
                };
                Self::push(
                    &mut frames,
                    StreamEvent::ContentBlockDelta {
                        index: block_index,
                        delta: StreamContentBlockDelta::InputJsonDelta {
                            partial_json: fragment,
                        },
                    },
                );
            }
            ReplyEvent::Finish { reason, usage } => {
                self.finished = true;
                self.close_block(&mut frames);
                Self::push(
                    &mut frames,
                    StreamEvent::MessageDelta {
                        delta: StreamMessageDelta {
                            stop_reason: Some(map_stop_reason(reason)),
                            stop_sequence: None,
                        },
                        usage: StreamUsage {
                            input_tokens: Some(usage.prompt_tokens),
                            output_tokens: usage.completion_tokens,
                        },
                    },
                );
                Self::push(&mut frames, StreamEvent::MessageStop);
            }
        }
        frames
    }

    fn encode_error(&mut self, code: &str, message: &str) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.finished = true;
        Self::push(
            &mut frames,
            StreamEvent::Error {
                error: claude_error(code, message).error,
            },
        );
        frames
    }
}

pub fn build_claude_message(id: &str, model: &str, reply: Reply, mode: ReasoningMode) -> Message {
    let mut content = Vec::new();
    let mut text = reply.content;
    match mode {
        ReasoningMode::ReasoningContent if !reply.reasoning.is_empty() => {
            content.push(ContentBlock::Thinking {
                thinking: reply.reasoning,
                signature: thinking_signature(),
            });
        }
        ReasoningMode::Content if !reply.reasoning.is_empty() => {
            text = format!("<think>\n{}\n</think>\n{text}", reply.reasoning);
        }
        _ => {}
    }
    if !text.is_empty() {
        content.push(ContentBlock::Text { text });
    }
    for call in reply.tool_calls {
        let input = serde_json::from_str(&call.arguments).unwrap_or_else(|err| {
            tracing::warn!(
                event = "tool_arguments_unparsable",
                tool_call_id = %call.id,
                error = %err,
            );
            JsonValue::Object(Default::default())
        });
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.name,
            input,
        });
    }

    Message {
        id: id.to_string(),
        r#type: MessageType::Message,
        role: MessageRole::Assistant,
        content,
        model: model.to_string(),
        stop_reason: Some(map_stop_reason(reply.finish)),
        stop_sequence: None,
        usage: Usage {
            input_tokens: reply.usage.prompt_tokens,
            output_tokens: reply.usage.completion_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::TokenUsage;
    use pretty_assertions::assert_eq;

    fn event_names(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .map(|frame| {
                let text = String::from_utf8_lossy(frame);
                text.lines()
                    .next()
                    .and_then(|line| line.strip_prefix("event: "))
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn blocks_open_and_close_in_order() {
        let mut encoder = ClaudeStreamEncoder::new("msg_1", "claude-opus-4.6", 42);
        let mut frames = Vec::new();
        for event in [
            ReplyEvent::Reasoning("hmm".to_string()),
            ReplyEvent::Text("Hello".to_string()),
            ReplyEvent::Text(" there".to_string()),
            ReplyEvent::ToolCallStart {
                index: 0,
                id: "toolu_1".to_string(),
                name: "ls".to_string(),
            },
            ReplyEvent::ToolCallArguments {
                index: 0,
                fragment: "{}".to_string(),
            },
            ReplyEvent::Finish {
                reason: FinishReason::ToolCalls,
                usage: TokenUsage {
                    prompt_tokens: 42,
                    completion_tokens: 7,
                },
            },
        ] {
            frames.extend(encoder.encode(event));
        }

        assert_eq!(
            event_names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(
            String::from_utf8_lossy(&frames[5]),
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n"
        );
        assert_eq!(
            String::from_utf8_lossy(&frames[11]),
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\",\"stop_sequence\":null},\"usage\":{\"input_tokens\":42,\"output_tokens\":7}}\n\n"
        );
        assert_eq!(
            String::from_utf8_lossy(&frames[12]),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }

    #[test]
    fn thinking_block_start_carries_signature() {
        let mut encoder = ClaudeStreamEncoder::new("msg_1", "m", 0);
        let frames = encoder.encode(ReplyEvent::Reasoning("a".to_string()));
        let start = String::from_utf8_lossy(&frames[1]).into_owned();
        assert!(start.contains("\"type\":\"thinking\",\"thinking\":\"\",\"signature\":\"sig_"));
    }

    #[test]
    fn non_stream_message_parses_tool_input() {
        let message = build_claude_message(
            "msg_1",
            "m",
            Reply {
                content: String::new(),
                reasoning: "r".to_string(),
                tool_calls: vec![crate::ToolCall {
                    id: "toolu_1".to_string(),
                    name: "ls".to_string(),
                    arguments: "{\"path\":\".\"}".to_string(),
                }],
                finish: FinishReason::ToolCalls,
                usage: TokenUsage::default(),
            },
            ReasoningMode::Drop,
        );
        assert_eq!(
            message.content,
            vec![ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "ls".to_string(),
                input: serde_json::json!({"path": "."}),
            }]
        );
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn arguments_without_an_open_tool_block_are_dropped() {
        let mut encoder = ClaudeStreamEncoder::new("msg_1", "m", 0);
        encoder.encode(ReplyEvent::ToolCallStart {
            index: 0,
            id: "toolu_1".to_string(),
            name: "ls".to_string(),
        });
        encoder.encode(ReplyEvent::Text("interleaved".to_string()));

        let frames = encoder.encode(ReplyEvent::ToolCallArguments {
            index: 0,
            fragment: "{}".to_string(),
        });
        assert!(frames.is_empty());
        let frames = encoder.encode(ReplyEvent::ToolCallArguments {
            index: 3,
            fragment: "{}".to_string(),
        });
        assert!(frames.is_empty());

        let frames = encoder.encode(ReplyEvent::Text(" more".to_string()));
        assert_eq!(event_names(&frames), vec!["content_block_delta"]);
        assert!(String::from_utf8_lossy(&frames[0]).contains("\"index\":1"));
    }
}
