//! Protocol-neutral conversation model shared by both client surfaces.

use kgate_protocol::GatewayOptions;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePart {
    /// e.g. `image/png`
    pub media_type: String,
    /// Base64 payload without the `data:` prefix.
    pub data: String,
}

impl ImagePart {
    /// Short format name the upstream expects (`png`, `jpeg`, ...).
    pub fn format(&self) -> &str {
        self.media_type
            .strip_prefix("image/")
            .unwrap_or(self.media_type.as_str())
    }

    /// Parses `data:<media>;base64,<payload>`.
    pub fn from_data_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (meta, data) = rest.split_once(',')?;
        let media_type = meta.strip_suffix(";base64")?;
        Some(Self {
            media_type: media_type.to_string(),
            data: data.to_string(),
        })
    }

    /// Decoded payload size in bytes.
    pub fn decoded_len(&self) -> usize {
        self.data.len() * 3 / 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, kept verbatim.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image(ImagePart),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Reasoning(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    /// Concatenated text parts, ignoring everything else.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text(text) = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    pub fn has_tool_results(&self) -> bool {
        self.tool_results().next().is_some()
    }

    /// Characters across every part, used for size estimates.
    pub fn char_len(&self) -> usize {
        self.parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) | ContentPart::Reasoning(text) => text.chars().count(),
                ContentPart::Image(image) => image.data.len(),
                ContentPart::ToolCall(call) => {
                    call.name.chars().count() + call.arguments.chars().count()
                }
                ContentPart::ToolResult(result) => result.content.chars().count(),
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

/// Which client protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientProtocol {
    OpenAIChat,
    AnthropicMessages,
}

/// A client request after protocol decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub protocol: ClientProtocol,
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// Native reasoning requested by the caller, with its token budget.
    pub thinking_budget: Option<u32>,
    pub options: GatewayOptions,
}

impl ChatRequest {
    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn system_text(&self) -> String {
        self.messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(Message::text_content)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_parsing() {
        let image = ImagePart::from_data_url("data:image/png;base64,AAAA").unwrap();
        assert_eq!(image.format(), "png");
        assert_eq!(image.data, "AAAA");
        assert!(ImagePart::from_data_url("https://example.com/a.png").is_none());
    }
}
