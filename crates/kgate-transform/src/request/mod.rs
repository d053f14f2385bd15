//! Client request decoding into the shared conversation model.

pub mod claude;
pub mod openai;

pub use claude::from_claude_messages;
pub use openai::from_openai_chat;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("request body is not valid JSON for this endpoint: {0}")]
    Malformed(String),
    #[error("`model` must not be empty")]
    EmptyModel,
    #[error("`messages` must contain at least one message")]
    EmptyMessages,
    #[error("messages[{index}]: {reason}")]
    InvalidMessage { index: usize, reason: String },
    #[error("tools[{index}]: {reason}")]
    InvalidTool { index: usize, reason: String },
    #[error("`{field}` must be positive")]
    NonPositive { field: &'static str },
}

impl ValidationError {
    pub(crate) fn message(index: usize, reason: impl Into<String>) -> Self {
        ValidationError::InvalidMessage {
            index,
            reason: reason.into(),
        }
    }
}
