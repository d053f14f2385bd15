use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::compress::text::{
    char_len, decision_summary, fold_arguments, head_tail, normalize_whitespace,
};
use crate::compress::{
    CompressionConfig, Phase, PhaseReport, Zone, Zones, markdown, skeleton,
};
use crate::conversation::{ContentPart, Message, Role};
use crate::tokens;

const SUBAGENT_PROTECTED: usize = 2;
const SUBAGENT_MIN_RESULT_CHARS: usize = 2000;
const DUPLICATE_MIN_CHARS: usize = 200;
const INVALID_ARGUMENTS: &str = "error: invalid arguments";
const READ_TOOLS: &[&str] = &["read", "read_file", "readfile", "fs_read", "view"];

type PhaseFn = fn(&mut Vec<Message>, &Env<'_>, &mut Budget) -> usize;

pub(super) struct Env<'a> {
    zones: Zones,
    config: &'a CompressionConfig,
    tool_names: &'a HashMap<String, String>,
}

impl Env<'_> {
    fn editable(&self, messages: &[Message], index: usize) -> bool {
        self.zones.zone(index) != Zone::A && messages[index].role != Role::System
    }
}

/// Characters a budgeted phase still has to shed.
pub(super) struct Budget {
    remaining: Option<usize>,
}

impl Budget {
    fn unbounded() -> Self {
        Self { remaining: None }
    }

    fn met(&self) -> bool {
        self.remaining == Some(0)
    }

    fn spend(&mut self, chars: usize) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(chars);
        }
    }
}

pub(super) struct Run<'a> {
    config: &'a CompressionConfig,
    messages: Vec<Message>,
    fixed_chars: usize,
    window: usize,
    subagent: bool,
    tool_names: HashMap<String, String>,
    reports: Vec<PhaseReport>,
}

impl<'a> Run<'a> {
    pub(super) fn new(
        config: &'a CompressionConfig,
        messages: Vec<Message>,
        fixed_chars: usize,
        window: usize,
        subagent: bool,
    ) -> Self {
        let tool_names = messages
            .iter()
            .flat_map(Message::tool_calls)
            .map(|call| (call.id.clone(), call.name.clone()))
            .collect();
        Self {
            config,
            messages,
            fixed_chars,
            window,
            subagent,
            tool_names,
            reports: Vec::new(),
        }
    }

    fn chars_of(&self, messages: &[Message]) -> usize {
        self.fixed_chars + messages.iter().map(Message::char_len).sum::<usize>()
    }

    pub(super) fn tokens(&self) -> usize {
        tokens::estimate(self.chars_of(&self.messages), self.config.chars_per_token)
    }

    fn trigger_tokens(&self) -> usize {
        (self.window as f64 * self.config.trigger_ratio) as usize
    }

    fn target_tokens(&self) -> usize {
        (self.window as f64 * self.config.target_ratio) as usize
    }

    fn zones(&self) -> Zones {
        if self.subagent {
            Zones::protect_last(self.messages.len(), SUBAGENT_PROTECTED)
        } else {
            Zones::classify(self.messages.len(), &self.config.zone_sizes())
        }
    }

    fn apply(&mut self, phase: Phase, budgeted: bool, rewrite: PhaseFn) {
        let before = self.tokens();
        let mut budget = if budgeted {
            let excess_tokens = before.saturating_sub(self.target_tokens());
            Budget {
                remaining: Some((excess_tokens as f64 * self.config.chars_per_token).ceil() as usize),
            }
        } else {
            Budget::unbounded()
        };
        let env = Env {
            zones: self.zones(),
            config: self.config,
            tool_names: &self.tool_names,
        };
        let mut candidate = self.messages.clone();
        let rewrites = rewrite(&mut candidate, &env, &mut budget);
        let after = tokens::estimate(self.chars_of(&candidate), self.config.chars_per_token);

        if after > before {
            warn!(
                event = "compression_phase_discarded",
                phase = phase.as_str(),
                tokens_before = before,
                tokens_after = after,
            );
            self.reports.push(PhaseReport {
                phase,
                tokens_before: before,
                tokens_after: before,
                rewrites: 0,
            });
            return;
        }
        debug!(
            event = "compression_phase",
            phase = phase.as_str(),
            tokens_before = before,
            tokens_after = after,
            rewrites,
        );
        self.messages = candidate;
        self.reports.push(PhaseReport {
            phase,
            tokens_before: before,
            tokens_after: after,
            rewrites,
        });
    }

    pub(super) fn standard(&mut self) {
        self.apply(Phase::Whitespace, false, whitespace);
        self.apply(Phase::Deduplicate, false, deduplicate);
        self.apply(Phase::RetryLoops, false, retry_loops);
        self.apply(Phase::Images, false, images);
        self.apply(Phase::Skeletonize, false, skeletonize);

        let over_trigger = self.tokens() > self.trigger_tokens();
        if over_trigger {
            self.apply(Phase::DropPairs, true, drop_pairs);
        }
        self.apply(Phase::SummarizeResults, false, summarize_results);
        self.apply(Phase::FoldAssistants, false, fold_assistants);
        if !over_trigger {
            return;
        }

        let lossy: [(Phase, PhaseFn); 3] = [
            (Phase::DeepFold, deep_fold),
            (Phase::TrimZoneB, trim_zone_b),
            (Phase::HardTruncate, hard_truncate),
        ];
        for (phase, rewrite) in lossy {
            if self.tokens() <= self.target_tokens() {
                break;
            }
            self.apply(phase, true, rewrite);
        }
    }

    pub(super) fn subagent(&mut self) {
        self.apply(Phase::SubagentCode, false, subagent_code);
        if self.tokens() > self.trigger_tokens() {
            self.apply(Phase::SubagentMarkdown, false, subagent_markdown);
        }
    }

    pub(super) fn finish(self) -> (Vec<Message>, Vec<PhaseReport>) {
        (self.messages, self.reports)
    }
}

/// Replaces `slot` when `replacement` is shorter; returns the characters saved.
fn shrink(slot: &mut String, replacement: String) -> Option<usize> {
    let old = char_len(slot);
    let new = char_len(&replacement);
    if new >= old {
        return None;
    }
    *slot = replacement;
    Some(old - new)
}

/// Applies `rewrite` to every text-bearing part of a message.
fn shrink_texts(
    message: &mut Message,
    budget: &mut Budget,
    mut rewrite: impl FnMut(&str) -> Option<String>,
) -> usize {
    let mut rewrites = 0;
    for part in &mut message.parts {
        let slot = match part {
            ContentPart::Text(text) => text,
            ContentPart::ToolResult(result) => &mut result.content,
            _ => continue,
        };
        if budget.met() {
            break;
        }
        if let Some(saved) = rewrite(slot).and_then(|replacement| shrink(slot, replacement)) {
            budget.spend(saved);
            rewrites += 1;
        }
    }
    rewrites
}

fn shrink_results(
    message: &mut Message,
    budget: &mut Budget,
    mut rewrite: impl FnMut(&str, &str) -> Option<String>,
) -> usize {
    let mut rewrites = 0;
    for part in &mut message.parts {
        let ContentPart::ToolResult(result) = part else {
            continue;
        };
        if budget.met() {
            break;
        }
        if let Some(saved) = rewrite(&result.tool_call_id, &result.content)
            .and_then(|replacement| shrink(&mut result.content, replacement))
        {
            budget.spend(saved);
            rewrites += 1;
        }
    }
    rewrites
}

fn drop_reasoning(message: &mut Message, budget: &mut Budget) -> usize {
    let before = message.parts.len();
    let mut saved = 0;
    message.parts.retain(|part| match part {
        ContentPart::Reasoning(text) => {
            saved += char_len(text);
            false
        }
        _ => true,
    });
    budget.spend(saved);
    before - message.parts.len()
}

fn fold_tool_calls(message: &mut Message, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for part in &mut message.parts {
        let ContentPart::ToolCall(call) = part else {
            continue;
        };
        if char_len(&call.arguments) <= 300 {
            continue;
        }
        if let Some(saved) =
            fold_arguments(&call.arguments, 200).and_then(|folded| shrink(&mut call.arguments, folded))
        {
            budget.spend(saved);
            rewrites += 1;
        }
    }
    rewrites
}

fn whitespace(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..messages.len() {
        if env.editable(messages, index) {
            rewrites += shrink_texts(&mut messages[index], budget, |text| {
                Some(normalize_whitespace(text))
            });
        }
    }
    rewrites
}

/// Earlier copies of a tool output that reappears verbatim later on.
fn deduplicate(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut seen: HashSet<String> = HashSet::new();
    let mut rewrites = 0;
    for index in (0..messages.len()).rev() {
        let editable = env.editable(messages, index);
        rewrites += shrink_results(&mut messages[index], budget, |_, content| {
            if char_len(content) < DUPLICATE_MIN_CHARS {
                return None;
            }
            if seen.insert(content.to_string()) || !editable {
                return None;
            }
            Some("[duplicate tool output omitted; the same output appears later]".to_string())
        });
    }
    rewrites
}

fn is_invalid_arguments(message: &Message) -> bool {
    message.role != Role::Assistant
        && message
            .tool_results()
            .any(|result| result.content.to_lowercase().contains(INVALID_ARGUMENTS))
}

/// Back-to-back tool call / "invalid arguments" cycles keep only their last
/// attempt. Cycles reaching into Zone A are left alone.
fn retry_loops(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    let mut run: Vec<usize> = Vec::new();
    let mut index = 1;
    while index < messages.len() {
        let cycle = messages[index - 1].role == Role::Assistant
            && messages[index - 1].tool_calls().next().is_some()
            && is_invalid_arguments(&messages[index])
            && env.editable(messages, index - 1)
            && env.editable(messages, index);
        if cycle {
            if run.last().is_some_and(|&start| start + 2 != index - 1) {
                runs.push(std::mem::take(&mut run));
            }
            run.push(index - 1);
            index += 2;
        } else {
            if !run.is_empty() {
                runs.push(std::mem::take(&mut run));
            }
            index += 1;
        }
    }
    if !run.is_empty() {
        runs.push(run);
    }

    let mut dropped: HashSet<usize> = HashSet::new();
    for run in runs.iter().filter(|run| run.len() >= 2) {
        for &start in &run[..run.len() - 1] {
            budget.spend(messages[start].char_len() + messages[start + 1].char_len());
            dropped.insert(start);
            dropped.insert(start + 1);
        }
    }
    if dropped.is_empty() {
        return 0;
    }
    debug!(event = "retry_loops_removed", messages = dropped.len());

    let removed = dropped.len();
    let mut index = 0;
    messages.retain(|_| {
        let keep = !dropped.contains(&index);
        index += 1;
        keep
    });
    removed
}

/// Base64 images outside Zone A become a short placeholder.
fn images(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..messages.len() {
        if !env.editable(messages, index) {
            continue;
        }
        for part in &mut messages[index].parts {
            let ContentPart::Image(image) = part else {
                continue;
            };
            let placeholder = format!(
                "[image: {}, ~{}KB removed from early context]",
                image.media_type,
                image.decoded_len() / 1024
            );
            let old = image.data.len();
            let new = char_len(&placeholder);
            if new >= old {
                continue;
            }
            budget.spend(old - new);
            *part = ContentPart::Text(placeholder);
            rewrites += 1;
        }
    }
    rewrites
}

fn skeletonize(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..env.zones.b_start.min(messages.len()) {
        if !env.editable(messages, index) {
            continue;
        }
        rewrites += shrink_results(&mut messages[index], budget, |_, content| {
            if char_len(content) < env.config.large_result_chars {
                return None;
            }
            skeleton::skeletonize_code(content, 0.8)
        });
    }
    rewrites
}

/// Whole turns, oldest first, each starting at a user message. Turns that
/// reach into Zone A are never dropped.
fn drop_pairs(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut turns: Vec<Vec<usize>> = Vec::new();
    for (index, message) in messages.iter().enumerate() {
        if message.role == Role::System {
            continue;
        }
        match turns.last_mut() {
            Some(turn) if message.role != Role::User => turn.push(index),
            _ => turns.push(vec![index]),
        }
    }

    let mut dropped: HashSet<usize> = HashSet::new();
    for turn in turns {
        if budget.met() {
            break;
        }
        let Some(&last) = turn.last() else {
            continue;
        };
        if last >= env.zones.a_start {
            break;
        }
        let chars: usize = turn.iter().map(|&index| messages[index].char_len()).sum();
        budget.spend(chars);
        dropped.extend(turn);
    }

    let removed = dropped.len();
    let mut index = 0;
    messages.retain(|_| {
        let keep = !dropped.contains(&index);
        index += 1;
        keep
    });
    removed
}

fn summarize_results(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..env.zones.c_start.min(messages.len()) {
        if !env.editable(messages, index) {
            continue;
        }
        let zone = env.zones.zone(index);
        rewrites += shrink_results(&mut messages[index], budget, |_, content| {
            let len = char_len(content);
            match zone {
                Zone::Expired if len >= DUPLICATE_MIN_CHARS => {
                    Some(format!("[earlier tool output omitted: {len} chars]"))
                }
                Zone::D if len >= 500 => Some(head_tail(content, 0.05)),
                _ => None,
            }
        });
    }
    rewrites
}

fn fold_assistants(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..env.zones.b_start.min(messages.len()) {
        if !env.editable(messages, index) || messages[index].role != Role::Assistant {
            continue;
        }
        let zone = env.zones.zone(index);
        let message = &mut messages[index];
        rewrites += drop_reasoning(message, budget);
        rewrites += fold_tool_calls(message, budget);
        if zone <= Zone::D {
            rewrites += shrink_texts(message, budget, |text| {
                (char_len(text) > 200).then(|| decision_summary(text))
            });
        }
    }
    rewrites
}

fn deep_fold(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..env.zones.a_start.min(messages.len()) {
        if budget.met() {
            break;
        }
        if !env.editable(messages, index) {
            continue;
        }
        let zone = env.zones.zone(index);
        let message = &mut messages[index];
        match message.role {
            Role::Assistant => {
                rewrites += drop_reasoning(message, budget);
                rewrites += fold_tool_calls(message, budget);
                rewrites += shrink_texts(message, budget, |text| {
                    (char_len(text) > 200).then(|| decision_summary(text))
                });
            }
            _ if zone <= Zone::C => {
                rewrites += shrink_results(message, budget, |_, content| {
                    (char_len(content) >= 1000).then(|| head_tail(content, 0.15))
                });
            }
            _ => {}
        }
    }
    rewrites
}

fn trim_zone_b(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in env.zones.b_start..env.zones.a_start.min(messages.len()) {
        if budget.met() {
            break;
        }
        if !env.editable(messages, index) {
            continue;
        }
        rewrites += shrink_results(&mut messages[index], budget, |_, content| {
            (char_len(content) > 15_000).then(|| head_tail(content, 0.35))
        });
    }
    rewrites
}

/// Last resort: head and tail of every oversized message outside Zone A.
fn hard_truncate(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..env.zones.a_start.min(messages.len()) {
        if budget.met() {
            break;
        }
        if !env.editable(messages, index) {
            continue;
        }
        rewrites += shrink_texts(&mut messages[index], budget, |text| {
            let len = char_len(text);
            let ratio = match len {
                0..1000 => return None,
                1000..=5000 => 0.15,
                5001..=10_000 => 0.10,
                _ => 0.05,
            };
            Some(head_tail(text, ratio))
        });
    }
    rewrites
}

fn is_read_tool(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    READ_TOOLS.contains(&name.as_str())
}

fn subagent_code(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..messages.len() {
        if !env.editable(messages, index) {
            continue;
        }
        rewrites += shrink_results(&mut messages[index], budget, |tool_call_id, content| {
            if char_len(content) < SUBAGENT_MIN_RESULT_CHARS {
                return None;
            }
            // Unknown names are tried too; the call may have been trimmed away.
            if let Some(name) = env.tool_names.get(tool_call_id)
                && !is_read_tool(name)
            {
                return None;
            }
            skeleton::skeletonize_code(content, 0.8)
        });
    }
    rewrites
}

fn subagent_markdown(messages: &mut Vec<Message>, env: &Env<'_>, budget: &mut Budget) -> usize {
    let mut rewrites = 0;
    for index in 0..messages.len() {
        if !env.editable(messages, index) {
            continue;
        }
        rewrites += shrink_results(&mut messages[index], budget, |_, content| {
            if char_len(content) < SUBAGENT_MIN_RESULT_CHARS || !markdown::looks_like_markdown(content)
            {
                return None;
            }
            markdown::skeletonize_markdown(content, 0.9)
        });
    }
    rewrites
}
