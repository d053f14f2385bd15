//! Upstream reply translation into client protocol shapes.

mod assembler;
pub mod claude;
pub mod openai;

use bytes::Bytes;

pub use assembler::{ReplyAssembler, ReplySummary};
pub use claude::{ClaudeStreamEncoder, build_claude_message};
pub use openai::{OpenAIChatStreamEncoder, build_openai_response};

use crate::conversation::ToolCall;

/// Protocol-neutral stream event, emitted in upstream arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    Text(String),
    Reasoning(String),
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallArguments { index: usize, fragment: String },
    Finish { reason: FinishReason, usage: TokenUsage },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// A complete reply, for non-stream responses.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish: FinishReason,
    pub usage: TokenUsage,
}

/// Turns reply events into wire frames for one client protocol.
pub trait StreamEncoder: Send {
    fn encode(&mut self, event: ReplyEvent) -> Vec<Bytes>;

    /// Frames reporting a failure after the stream has started.
    fn encode_error(&mut self, code: &str, message: &str) -> Vec<Bytes>;
}

fn push_frame(frames: &mut Vec<Bytes>, frame: Result<Bytes, serde_json::Error>) {
    match frame {
        Ok(frame) => frames.push(frame),
        Err(err) => tracing::warn!(event = "stream_frame_encode_failed", error = %err),
    }
}
