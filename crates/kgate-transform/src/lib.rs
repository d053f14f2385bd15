pub mod compress;
pub mod conversation;
pub mod kiro_request;
pub mod reasoning;
pub mod request;
pub mod response;
pub mod tokens;

pub use conversation::{
    ChatRequest, ContentPart, ImagePart, Message, Role, ToolCall, ToolDefinition, ToolResult,
};
pub use request::ValidationError;
