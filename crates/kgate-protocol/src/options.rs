use serde::{Deserialize, Serialize};

/// How reasoning text extracted from the upstream stream is shown to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    /// Reasoning is discarded.
    #[default]
    Drop,
    /// Reasoning is carried on the protocol's dedicated reasoning channel.
    ReasoningContent,
    /// Reasoning is inlined into the answer wrapped in `<think>` tags.
    Content,
}

impl ReasoningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningMode::Drop => "drop",
            ReasoningMode::ReasoningContent => "reasoning_content",
            ReasoningMode::Content => "content",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Gateway-specific request options accepted on every surface alongside the
/// standard chat fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOptions {
    #[serde(default)]
    pub reasoning_mode: ReasoningMode,
    #[serde(default = "default_true")]
    pub context_compression: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            reasoning_mode: ReasoningMode::Drop,
            context_compression: true,
        }
    }
}
