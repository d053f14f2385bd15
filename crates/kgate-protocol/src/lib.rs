pub mod claude;
pub mod kiro;
pub mod openai;
pub mod options;
pub mod sse;

pub use options::{GatewayOptions, ReasoningMode};
