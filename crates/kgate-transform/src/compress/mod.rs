//! Staged context compression.
//!
//! Phases run in a fixed order. Normalization phases (1 through 3b) always
//! run; pair dropping (2c) and the lossy phases (4 through 6) only run when the
//! normalized conversation is still above the trigger, and each stops as soon
//! as the target is met. A phase whose result would grow the estimate is
//! discarded, so token counts never increase from one phase to the next.

mod markdown;
mod phases;
mod skeleton;
mod text;
mod zones;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::conversation::{Message, Role, ToolDefinition};

pub use markdown::{looks_like_markdown, skeletonize_markdown};
pub use skeleton::{looks_like_code, skeletonize_code};
pub use text::head_tail;
pub use zones::{Zone, ZoneSizes, Zones};

pub const DEFAULT_SUBAGENT_MARKERS: &[&str] = &[
    "file search specialist",
    "read-only mode",
    "read-only exploration task",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub context_window: usize,
    pub trigger_ratio: f64,
    pub target_ratio: f64,
    pub chars_per_token: f64,
    pub zone_a: usize,
    pub zone_b: usize,
    pub zone_c: usize,
    pub zone_d: usize,
    /// Tool results shorter than this are never skeletonized.
    pub large_result_chars: usize,
    pub subagent_markers: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            trigger_ratio: 0.70,
            target_ratio: 0.55,
            chars_per_token: 2.8,
            zone_a: 10,
            zone_b: 30,
            zone_c: 60,
            zone_d: 120,
            large_result_chars: 1500,
            subagent_markers: DEFAULT_SUBAGENT_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }
}

impl CompressionConfig {
    pub fn zone_sizes(&self) -> ZoneSizes {
        ZoneSizes {
            a: self.zone_a,
            b: self.zone_b,
            c: self.zone_c,
            d: self.zone_d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Whitespace,
    Deduplicate,
    RetryLoops,
    Images,
    Skeletonize,
    DropPairs,
    SummarizeResults,
    FoldAssistants,
    DeepFold,
    TrimZoneB,
    HardTruncate,
    SubagentCode,
    SubagentMarkdown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Whitespace => "1",
            Phase::Deduplicate => "2a",
            Phase::RetryLoops => "2a-retry",
            Phase::Images => "2a-images",
            Phase::Skeletonize => "2b",
            Phase::DropPairs => "2c",
            Phase::SummarizeResults => "3a",
            Phase::FoldAssistants => "3b",
            Phase::DeepFold => "4",
            Phase::TrimZoneB => "5",
            Phase::HardTruncate => "6",
            Phase::SubagentCode => "subagent-code",
            Phase::SubagentMarkdown => "subagent-markdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub rewrites: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionReport {
    pub subagent: bool,
    pub context_window: usize,
    pub target_tokens: usize,
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub original_messages: usize,
    pub final_messages: usize,
    pub phases: Vec<PhaseReport>,
}

impl CompressionReport {
    /// Still larger than the window after every phase ran.
    pub fn overflow(&self) -> bool {
        self.final_tokens > self.context_window
    }
}

#[derive(Debug, Clone)]
pub struct Compressed {
    pub messages: Vec<Message>,
    pub report: CompressionReport,
}

#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// `context_window` overrides the configured window, e.g. from model metadata.
    pub fn compress(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        context_window: Option<usize>,
    ) -> Compressed {
        let window = context_window.unwrap_or(self.config.context_window);
        let fixed_chars = tools
            .iter()
            .map(|tool| {
                text::char_len(&tool.name)
                    + text::char_len(&tool.description)
                    + text::char_len(&tool.parameters.to_string())
            })
            .sum();
        let subagent = is_subagent(messages, &self.config.subagent_markers);
        let original_messages = messages.len();
        let mut run = phases::Run::new(&self.config, messages.to_vec(), fixed_chars, window, subagent);
        let original_tokens = run.tokens();

        if subagent {
            run.subagent();
        } else {
            run.standard();
        }

        let (messages, phase_reports) = run.finish();
        let final_tokens = phase_reports
            .last()
            .map(|phase| phase.tokens_after)
            .unwrap_or(original_tokens);
        let report = CompressionReport {
            subagent,
            context_window: window,
            target_tokens: (window as f64 * self.config.target_ratio) as usize,
            original_tokens,
            final_tokens,
            original_messages,
            final_messages: messages.len(),
            phases: phase_reports,
        };

        if final_tokens < original_tokens {
            info!(
                event = "context_compressed",
                subagent,
                original_tokens,
                final_tokens,
                original_messages,
                final_messages = report.final_messages,
                phases = %report
                    .phases
                    .iter()
                    .filter(|phase| phase.rewrites > 0)
                    .map(|phase| phase.phase.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if report.overflow() {
            warn!(
                event = "compression_overflow",
                phase = "compress",
                final_tokens,
                context_window = window,
            );
        }
        Compressed { messages, report }
    }
}

/// The latest user turn carries the subagent role declaration.
fn is_subagent(messages: &[Message], markers: &[String]) -> bool {
    let Some(latest) = messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
    else {
        return false;
    };
    let head: String = latest.text_content().chars().take(2000).collect();
    let head = head.to_lowercase();
    markers
        .iter()
        .any(|marker| head.contains(&marker.to_lowercase()))
}
