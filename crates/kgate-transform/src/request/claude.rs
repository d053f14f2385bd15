use kgate_protocol::GatewayOptions;
use kgate_protocol::claude::messages::{
    ContentBlockParam, CreateMessageRequestBody, ImageSource, MessageContent, MessageRole,
    ThinkingConfigParam, ToolResultBlock, ToolResultContent,
};
use tracing::warn;

use crate::conversation::{
    ChatRequest, ClientProtocol, ContentPart, ImagePart, Message, Role, ToolCall, ToolDefinition,
    ToolResult,
};
use crate::request::ValidationError;

pub fn from_claude_messages(body: CreateMessageRequestBody) -> Result<ChatRequest, ValidationError> {
    if body.model.trim().is_empty() {
        return Err(ValidationError::EmptyModel);
    }
    if body.messages.is_empty() {
        return Err(ValidationError::EmptyMessages);
    }
    if body.max_tokens == 0 {
        return Err(ValidationError::NonPositive {
            field: "max_tokens",
        });
    }

    let mut messages = Vec::with_capacity(body.messages.len() + 1);
    if let Some(system) = body.system.as_ref() {
        let text = system.joined();
        if !text.is_empty() {
            messages.push(Message::text(Role::System, text));
        }
    }

    for (index, message) in body.messages.into_iter().enumerate() {
        let blocks = match message.content {
            MessageContent::Text(text) => vec![ContentBlockParam::Text { text }],
            MessageContent::Blocks(blocks) => blocks,
        };
        match message.role {
            MessageRole::User => push_user_blocks(index, blocks, &mut messages)?,
            MessageRole::Assistant => messages.push(assistant_message(index, blocks)?),
        }
    }

    let mut tools = Vec::new();
    for (index, tool) in body.tools.unwrap_or_default().into_iter().enumerate() {
        if tool.name.trim().is_empty() {
            return Err(ValidationError::InvalidTool {
                index,
                reason: "tool name is empty".to_string(),
            });
        }
        tools.push(ToolDefinition {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            parameters: tool.input_schema,
        });
    }

    if body.stop_sequences.is_some() {
        warn!(
            event = "unsupported_field",
            field = "stop_sequences",
            protocol = "anthropic"
        );
    }

    let thinking_budget = match body.thinking {
        Some(ThinkingConfigParam::Enabled { budget_tokens }) => Some(budget_tokens),
        _ => None,
    };

    let defaults = GatewayOptions::default();
    Ok(ChatRequest {
        protocol: ClientProtocol::AnthropicMessages,
        model: body.model,
        messages,
        tools,
        stream: body.stream.unwrap_or(false),
        max_tokens: Some(body.max_tokens),
        temperature: body.temperature,
        top_p: body.top_p,
        thinking_budget,
        options: GatewayOptions {
            reasoning_mode: body.reasoning_mode.unwrap_or(if thinking_budget.is_some() {
                kgate_protocol::ReasoningMode::ReasoningContent
            } else {
                defaults.reasoning_mode
            }),
            context_compression: body
                .context_compression
                .unwrap_or(defaults.context_compression),
        },
    })
}

/// Tool results travel in user turns on this protocol; they are split out into
/// their own tool messages so both protocols share one shape.
fn push_user_blocks(
    index: usize,
    blocks: Vec<ContentBlockParam>,
    out: &mut Vec<Message>,
) -> Result<(), ValidationError> {
    let mut results = Vec::new();
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlockParam::Text { text } => parts.push(ContentPart::Text(text)),
            ContentBlockParam::Image { source } => {
                if let Some(image) = image_part(index, source) {
                    parts.push(ContentPart::Image(image));
                }
            }
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if tool_use_id.is_empty() {
                    return Err(ValidationError::message(index, "tool_use_id is empty"));
                }
                results.push(ContentPart::ToolResult(ToolResult {
                    tool_call_id: tool_use_id,
                    content: tool_result_text(index, content),
                    is_error: is_error.unwrap_or(false),
                }));
            }
            ContentBlockParam::Thinking { .. }
            | ContentBlockParam::RedactedThinking { .. }
            | ContentBlockParam::ToolUse { .. } => {
                return Err(ValidationError::message(
                    index,
                    "user message contains an assistant-only block",
                ));
            }
        }
    }
    if !results.is_empty() {
        out.push(Message {
            role: Role::Tool,
            parts: results,
        });
    }
    if !parts.is_empty() {
        out.push(Message {
            role: Role::User,
            parts,
        });
    }
    Ok(())
}

fn assistant_message(
    index: usize,
    blocks: Vec<ContentBlockParam>,
) -> Result<Message, ValidationError> {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlockParam::Text { text } => parts.push(ContentPart::Text(text)),
            ContentBlockParam::Thinking { thinking, .. } => {
                parts.push(ContentPart::Reasoning(thinking))
            }
            ContentBlockParam::RedactedThinking { .. } => {}
            ContentBlockParam::ToolUse { id, name, input } => {
                parts.push(ContentPart::ToolCall(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }))
            }
            ContentBlockParam::Image { .. } | ContentBlockParam::ToolResult { .. } => {
                return Err(ValidationError::message(
                    index,
                    "assistant message contains a user-only block",
                ));
            }
        }
    }
    Ok(Message {
        role: Role::Assistant,
        parts,
    })
}

fn image_part(index: usize, source: ImageSource) -> Option<ImagePart> {
    match source {
        ImageSource::Base64 { media_type, data } => Some(ImagePart { media_type, data }),
        ImageSource::Url { .. } => {
            warn!(event = "unsupported_content", index, kind = "remote_image_url");
            None
        }
    }
}

fn tool_result_text(index: usize, content: Option<ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text,
        Some(ToolResultContent::Blocks(blocks)) => {
            let mut texts = Vec::new();
            for block in blocks {
                match block {
                    ToolResultBlock::Text { text } => texts.push(text),
                    ToolResultBlock::Image { .. } => {
                        warn!(event = "unsupported_content", index, kind = "tool_result_image")
                    }
                }
            }
            texts.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_protocol::ReasoningMode;
    use pretty_assertions::assert_eq;

    #[test]
    fn tool_results_split_out_of_user_turns() {
        let body: CreateMessageRequestBody = serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4.5",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "sys"}],
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [
                {"role": "user", "content": "read a"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "plan", "signature": "s"},
                    {"type": "tool_use", "id": "tu_1", "name": "read", "input": {"path": "a"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": [{"type": "text", "text": "body"}]},
                    {"type": "text", "text": "now summarize"}
                ]}
            ]
        }))
        .unwrap();
        let request = from_claude_messages(body).unwrap();

        assert_eq!(request.thinking_budget, Some(2048));
        assert_eq!(request.options.reasoning_mode, ReasoningMode::ReasoningContent);
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::User]
        );
        assert_eq!(
            request.messages[3].parts[0],
            ContentPart::ToolResult(ToolResult {
                tool_call_id: "tu_1".to_string(),
                content: "body".to_string(),
                is_error: false,
            })
        );
        assert_eq!(
            request.messages[2].parts[1],
            ContentPart::ToolCall(ToolCall {
                id: "tu_1".to_string(),
                name: "read".to_string(),
                arguments: "{\"path\":\"a\"}".to_string(),
            })
        );
    }

    #[test]
    fn zero_max_tokens_is_rejected() {
        let body: CreateMessageRequestBody = serde_json::from_value(serde_json::json!({
            "model": "m", "max_tokens": 0, "messages": [{"role": "user", "content": "x"}]
        }))
        .unwrap();
        assert_eq!(
            from_claude_messages(body).unwrap_err(),
            ValidationError::NonPositive { field: "max_tokens" }
        );
    }
}
