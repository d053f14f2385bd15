use kgate_protocol::GatewayOptions;
use kgate_protocol::openai::chat::{
    ChatCompletionAssistantContent, ChatCompletionAssistantContentPart,
    ChatCompletionMessageToolCall, ChatCompletionRequestMessage, ChatCompletionToolDefinition,
    ChatCompletionUserContent, ChatCompletionUserContentPart, CreateChatCompletionRequestBody,
};
use tracing::warn;

use crate::conversation::{
    ChatRequest, ClientProtocol, ContentPart, ImagePart, Message, Role, ToolCall, ToolDefinition,
    ToolResult,
};
use crate::request::ValidationError;

pub fn from_openai_chat(body: CreateChatCompletionRequestBody) -> Result<ChatRequest, ValidationError> {
    if body.model.trim().is_empty() {
        return Err(ValidationError::EmptyModel);
    }
    if body.messages.is_empty() {
        return Err(ValidationError::EmptyMessages);
    }

    let mut messages = Vec::with_capacity(body.messages.len());
    for (index, message) in body.messages.into_iter().enumerate() {
        messages.push(convert_message(index, message)?);
    }

    let mut tools = Vec::new();
    for (index, tool) in body.tools.unwrap_or_default().into_iter().enumerate() {
        let ChatCompletionToolDefinition::Function { function } = tool;
        if function.name.trim().is_empty() {
            return Err(ValidationError::InvalidTool {
                index,
                reason: "function name is empty".to_string(),
            });
        }
        tools.push(ToolDefinition {
            name: function.name,
            description: function.description.unwrap_or_default(),
            parameters: function
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        });
    }

    let max_tokens = match body.max_completion_tokens.or(body.max_tokens) {
        Some(value) if value <= 0 => {
            return Err(ValidationError::NonPositive {
                field: "max_tokens",
            });
        }
        Some(value) => Some(u32::try_from(value).unwrap_or(u32::MAX)),
        None => None,
    };

    if body.stop.is_some() {
        warn!(event = "unsupported_field", field = "stop", protocol = "openai");
    }

    let defaults = GatewayOptions::default();
    Ok(ChatRequest {
        protocol: ClientProtocol::OpenAIChat,
        model: body.model,
        messages,
        tools,
        stream: body.stream.unwrap_or(false),
        max_tokens,
        temperature: body.temperature,
        top_p: body.top_p,
        thinking_budget: None,
        options: GatewayOptions {
            reasoning_mode: body.reasoning_mode.unwrap_or(defaults.reasoning_mode),
            context_compression: body
                .context_compression
                .unwrap_or(defaults.context_compression),
        },
    })
}

fn convert_message(
    index: usize,
    message: ChatCompletionRequestMessage,
) -> Result<Message, ValidationError> {
    match message {
        ChatCompletionRequestMessage::Developer(message) => {
            Ok(Message::text(Role::System, message.content.joined()))
        }
        ChatCompletionRequestMessage::System(message) => {
            Ok(Message::text(Role::System, message.content.joined()))
        }
        ChatCompletionRequestMessage::User(message) => {
            let parts = match message.content {
                ChatCompletionUserContent::Text(text) => vec![ContentPart::Text(text)],
                ChatCompletionUserContent::Parts(parts) => {
                    if parts.is_empty() {
                        return Err(ValidationError::message(index, "content parts are empty"));
                    }
                    let mut out = Vec::with_capacity(parts.len());
                    for part in parts {
                        match part {
                            ChatCompletionUserContentPart::Text { text } => {
                                out.push(ContentPart::Text(text))
                            }
                            ChatCompletionUserContentPart::ImageUrl { image_url } => {
                                match ImagePart::from_data_url(&image_url.url) {
                                    Some(image) => out.push(ContentPart::Image(image)),
                                    None => warn!(
                                        event = "unsupported_content",
                                        index,
                                        kind = "remote_image_url"
                                    ),
                                }
                            }
                        }
                    }
                    out
                }
            };
            Ok(Message {
                role: Role::User,
                parts,
            })
        }
        ChatCompletionRequestMessage::Assistant(message) => {
            let mut parts = Vec::new();
            if let Some(reasoning) = message.reasoning_content.filter(|text| !text.is_empty()) {
                parts.push(ContentPart::Reasoning(reasoning));
            }
            let has_content = message.content.is_some();
            match message.content {
                Some(ChatCompletionAssistantContent::Text(text)) => {
                    parts.push(ContentPart::Text(text))
                }
                Some(ChatCompletionAssistantContent::Parts(items)) => {
                    for item in items {
                        match item {
                            ChatCompletionAssistantContentPart::Text { text } => {
                                parts.push(ContentPart::Text(text))
                            }
                            ChatCompletionAssistantContentPart::Refusal { refusal } => {
                                parts.push(ContentPart::Text(refusal))
                            }
                        }
                    }
                }
                None => {}
            }
            let tool_calls = message.tool_calls.unwrap_or_default();
            if !has_content && tool_calls.is_empty() {
                return Err(ValidationError::message(
                    index,
                    "assistant message needs content or tool_calls",
                ));
            }
            for call in tool_calls {
                let ChatCompletionMessageToolCall::Function { id, function } = call;
                if id.is_empty() {
                    return Err(ValidationError::message(index, "tool call id is empty"));
                }
                parts.push(ContentPart::ToolCall(ToolCall {
                    id,
                    name: function.name,
                    arguments: function.arguments,
                }));
            }
            Ok(Message {
                role: Role::Assistant,
                parts,
            })
        }
        ChatCompletionRequestMessage::Tool(message) => {
            if message.tool_call_id.is_empty() {
                return Err(ValidationError::message(index, "tool_call_id is empty"));
            }
            Ok(Message {
                role: Role::Tool,
                parts: vec![ContentPart::ToolResult(ToolResult {
                    tool_call_id: message.tool_call_id,
                    content: message.content.joined(),
                    is_error: false,
                })],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_protocol::ReasoningMode;
    use pretty_assertions::assert_eq;

    fn parse(value: serde_json::Value) -> Result<ChatRequest, ValidationError> {
        from_openai_chat(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn converts_roles_tools_and_options() {
        let request = parse(serde_json::json!({
            "model": "kiro-opus-4-6",
            "stream": true,
            "reasoning_mode": "content",
            "messages": [
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,QUJD"}}
                ]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "read", "arguments": "{\"path\":\"a\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "file body"}
            ],
            "tools": [{"type": "function", "function": {"name": "read", "parameters": {"type": "object"}}}]
        }))
        .unwrap();

        assert!(request.stream);
        assert_eq!(request.options.reasoning_mode, ReasoningMode::Content);
        assert!(request.options.context_compression);
        assert_eq!(request.messages[0], Message::text(Role::System, "be brief"));
        assert_eq!(
            request.messages[1].parts[1],
            ContentPart::Image(ImagePart {
                media_type: "image/jpeg".to_string(),
                data: "QUJD".to_string(),
            })
        );
        assert_eq!(request.messages[2].tool_calls().count(), 1);
        assert_eq!(request.messages[3].role, Role::Tool);
        assert_eq!(request.tools[0].name, "read");
    }

    #[test]
    fn rejects_empty_messages_and_bare_assistant() {
        assert_eq!(
            parse(serde_json::json!({"model": "m", "messages": []})).unwrap_err(),
            ValidationError::EmptyMessages
        );
        let err = parse(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}, {"role": "assistant"}]
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMessage { index: 1, .. }));
    }
}
