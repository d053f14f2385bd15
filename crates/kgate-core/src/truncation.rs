//! Replies that stopped early despite a normal finish.
//!
//! [`detect`] is a pure predicate over the finished reply. The ledger
//! remembers what was cut so the next request in the same conversation can
//! tell the model about it; entries are consumed on first match.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use kgate_transform::conversation::{ContentPart, Message, Role, ToolCall};
use kgate_transform::response::FinishReason;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub const CONTINUATION_PROMPT: &str = "[System notice] Your previous response was cut off before it finished. Continue exactly where you stopped, without repeating anything you already wrote.";

/// Characters of content that identify a truncated reply.
const CONTENT_KEY_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    /// Replies at or under this many completion tokens count as short. Zero disables the rule.
    pub short_reply_tokens: u32,
    /// The short-reply rule only applies to prompts at least this large.
    pub min_prompt_tokens: u32,
    /// Resubmit truncated non-stream replies once.
    pub continuation: bool,
    pub ledger_capacity: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            short_reply_tokens: 30,
            min_prompt_tokens: 10_000,
            continuation: true,
            ledger_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationKind {
    /// The stream ended without usage, context-usage or stop events.
    MissingCompletionSignal,
    /// A tool call's JSON arguments were never closed.
    UnbalancedToolArguments,
    /// A near-empty stop right after a tool result, on a tool-using request.
    ShortStopAfterToolResult,
}

impl TruncationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruncationKind::MissingCompletionSignal => "missing_completion_signal",
            TruncationKind::UnbalancedToolArguments => "unbalanced_tool_arguments",
            TruncationKind::ShortStopAfterToolResult => "short_stop_after_tool_result",
        }
    }
}

/// What is known about a reply once the upstream stream ended.
#[derive(Debug, Clone)]
pub struct ReplyFacts<'a> {
    pub finish: FinishReason,
    pub completion_signal: bool,
    pub produced_text: bool,
    pub tool_calls: &'a [ToolCall],
    pub request_has_tools: bool,
    pub after_tool_result: bool,
    pub completion_tokens: u32,
    pub prompt_tokens: u32,
    pub text: &'a str,
    /// Whether the short-stop rule is active for this surface.
    pub short_stop_rule: bool,
}

pub fn detect(facts: &ReplyFacts<'_>, config: &TruncationConfig) -> Option<TruncationKind> {
    if !facts.completion_signal && facts.produced_text && facts.tool_calls.is_empty() {
        return Some(TruncationKind::MissingCompletionSignal);
    }
    if facts
        .tool_calls
        .iter()
        .any(|call| arguments_unbalanced(&call.arguments))
    {
        return Some(TruncationKind::UnbalancedToolArguments);
    }
    if facts.short_stop_rule
        && config.short_reply_tokens > 0
        && facts.finish == FinishReason::Stop
        && facts.tool_calls.is_empty()
        && facts.request_has_tools
        && facts.after_tool_result
        && facts.completion_tokens <= config.short_reply_tokens
        && facts.prompt_tokens >= config.min_prompt_tokens
        && !has_cjk(facts.text)
    {
        return Some(TruncationKind::ShortStopAfterToolResult);
    }
    None
}

/// Whether JSON tool arguments look cut off rather than merely malformed.
pub fn arguments_unbalanced(arguments: &str) -> bool {
    let trimmed = arguments.trim();
    if trimmed.is_empty() || serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return false;
    }
    if (trimmed.starts_with('{') && !trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && !trimmed.ends_with(']'))
    {
        return true;
    }
    let count = |ch: char| trimmed.chars().filter(|c| *c == ch).count();
    if count('{') != count('}') || count('[') != count(']') {
        return true;
    }
    let mut quotes = 0usize;
    let mut escaped = false;
    for ch in trimmed.chars() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => quotes += 1,
            _ => {}
        }
    }
    quotes % 2 != 0
}

/// CJK ideographs, kana and hangul.
pub fn has_cjk(text: &str) -> bool {
    text.chars().any(|ch| {
        matches!(ch,
            '\u{4e00}'..='\u{9fff}'
            | '\u{3400}'..='\u{4dbf}'
            | '\u{3040}'..='\u{309f}'
            | '\u{30a0}'..='\u{30ff}'
            | '\u{ac00}'..='\u{d7af}'
            | '\u{f900}'..='\u{faff}')
    })
}

/// Whether the latest non-system message carries tool results.
pub fn follows_tool_result(messages: &[Message]) -> bool {
    messages
        .iter()
        .rev()
        .find(|message| message.role != Role::System)
        .is_some_and(|message| message.role == Role::Tool || message.has_tool_results())
}

/// Strips an inline `<think>` block so the key matches what the client echoes back.
fn visible_answer(text: &str) -> &str {
    let trimmed = text.trim_start();
    if trimmed.starts_with("<think>")
        && let Some(end) = trimmed.find("</think>")
    {
        return trimmed[end + "</think>".len()..].trim_start_matches('\n');
    }
    text
}

pub fn content_key(content: &str) -> String {
    let head: String = visible_answer(content)
        .chars()
        .take(CONTENT_KEY_CHARS)
        .collect();
    let digest = Sha256::digest(head.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LedgerKey {
    Tool(String),
    Content(String),
}

#[derive(Debug, Clone)]
struct ToolNotice {
    name: String,
    kind: TruncationKind,
}

#[derive(Debug, Default)]
struct LedgerInner {
    tools: HashMap<String, ToolNotice>,
    contents: HashMap<String, TruncationKind>,
    order: VecDeque<LedgerKey>,
}

/// One-shot memory of truncated replies, bounded by capacity.
#[derive(Debug)]
pub struct TruncationLedger {
    inner: Mutex<LedgerInner>,
    capacity: usize,
}

impl Default for TruncationLedger {
    fn default() -> Self {
        Self::new(TruncationConfig::default().ledger_capacity)
    }
}

impl TruncationLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.tools.len() + inner.contents.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_tool(&self, tool_call_id: &str, name: &str, kind: TruncationKind) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.tools.insert(
            tool_call_id.to_string(),
            ToolNotice {
                name: name.to_string(),
                kind,
            },
        );
        self.push_key(&mut inner, LedgerKey::Tool(tool_call_id.to_string()));
    }

    pub fn record_content(&self, content: &str, kind: TruncationKind) -> String {
        let key = content_key(content);
        if let Ok(mut inner) = self.inner.lock() {
            inner.contents.insert(key.clone(), kind);
            self.push_key(&mut inner, LedgerKey::Content(key.clone()));
        }
        key
    }

    /// Records everything a truncated reply left dangling.
    pub fn record_reply(&self, content: &str, tool_calls: &[ToolCall], kind: TruncationKind) {
        let mut recorded = false;
        for call in tool_calls {
            if arguments_unbalanced(&call.arguments) {
                self.record_tool(&call.id, &call.name, kind);
                recorded = true;
            }
        }
        if !recorded && !content.trim().is_empty() {
            self.record_content(content, kind);
        }
    }

    fn push_key(&self, inner: &mut LedgerInner, key: LedgerKey) {
        inner.order.retain(|existing| existing != &key);
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            match inner.order.pop_front() {
                Some(LedgerKey::Tool(id)) => {
                    inner.tools.remove(&id);
                }
                Some(LedgerKey::Content(key)) => {
                    inner.contents.remove(&key);
                }
                None => break,
            }
        }
    }

    fn take_tool(&self, tool_call_id: &str) -> Option<ToolNotice> {
        let mut inner = self.inner.lock().ok()?;
        let notice = inner.tools.remove(tool_call_id)?;
        let key = LedgerKey::Tool(tool_call_id.to_string());
        inner.order.retain(|existing| existing != &key);
        Some(notice)
    }

    fn take_content(&self, content: &str) -> Option<TruncationKind> {
        let key = content_key(content);
        let mut inner = self.inner.lock().ok()?;
        let kind = inner.contents.remove(&key)?;
        let key = LedgerKey::Content(key);
        inner.order.retain(|existing| existing != &key);
        Some(kind)
    }

    /// Adds notices for earlier truncations found in `messages`. Returns how many were added.
    pub fn annotate(&self, messages: Vec<Message>) -> (Vec<Message>, usize) {
        if self.is_empty() {
            return (messages, 0);
        }
        let mut added = 0;
        let mut out = Vec::with_capacity(messages.len());
        for mut message in messages {
            for part in &mut message.parts {
                if let ContentPart::ToolResult(result) = part
                    && let Some(notice) = self.take_tool(&result.tool_call_id)
                {
                    result.content = format!(
                        "{}\n\n---\n\nOriginal tool result:\n{}",
                        tool_notice(&notice),
                        result.content
                    );
                    added += 1;
                }
            }
            let content_hit = message.role == Role::Assistant
                && message.tool_calls().next().is_none()
                && self.take_content(&message.text_content()).is_some();
            out.push(message);
            if content_hit {
                out.push(Message::text(Role::User, CONTINUATION_PROMPT));
                added += 1;
            }
        }
        if added > 0 {
            info!(event = "truncation_notices_added", phase = "truncation", count = added);
        }
        (out, added)
    }
}

fn tool_notice(notice: &ToolNotice) -> String {
    format!(
        "[System notice] Your previous call to `{}` was cut off before its arguments were complete ({}), so it did not run as intended. Re-issue the call with complete arguments, splitting large content into smaller pieces if needed.",
        notice.name,
        notice.kind.as_str()
    )
}

/// Request messages for the one continuation attempt.
pub fn continuation_messages(messages: &[Message], partial: &str) -> Vec<Message> {
    let mut out = messages.to_vec();
    out.push(Message::text(Role::Assistant, partial));
    out.push(Message::text(Role::User, CONTINUATION_PROMPT));
    out
}

/// Joins the continuation onto the partial reply, dropping a repeated overlap.
pub fn stitch(partial: &str, continuation: &str) -> String {
    let max = partial.len().min(continuation.len()).min(200);
    for len in (8..=max).rev() {
        if !partial.is_char_boundary(partial.len() - len) || !continuation.is_char_boundary(len) {
            continue;
        }
        if partial[partial.len() - len..] == continuation[..len] {
            return format!("{partial}{}", &continuation[len..]);
        }
    }
    if continuation.is_empty() {
        warn!(event = "continuation_empty", phase = "truncation");
    }
    format!("{partial}{continuation}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_transform::conversation::ToolResult;

    fn facts<'a>(text: &'a str, calls: &'a [ToolCall]) -> ReplyFacts<'a> {
        ReplyFacts {
            finish: FinishReason::Stop,
            completion_signal: true,
            produced_text: !text.is_empty(),
            tool_calls: calls,
            request_has_tools: true,
            after_tool_result: true,
            completion_tokens: 12,
            prompt_tokens: 48_000,
            text,
            short_stop_rule: true,
        }
    }

    #[test]
    fn short_stop_after_tool_result_is_truncation() {
        let config = TruncationConfig::default();
        assert_eq!(
            detect(&facts("Let me check the file.", &[]), &config),
            Some(TruncationKind::ShortStopAfterToolResult)
        );

        let mut long = facts("done", &[]);
        long.completion_tokens = 400;
        assert_eq!(detect(&long, &config), None);

        let mut small_prompt = facts("done", &[]);
        small_prompt.prompt_tokens = 900;
        assert_eq!(detect(&small_prompt, &config), None);

        let mut standard = facts("done", &[]);
        standard.short_stop_rule = false;
        assert_eq!(detect(&standard, &config), None);

        assert_eq!(detect(&facts("我来看看这个文件", &[]), &config), None);
    }

    #[test]
    fn missing_signal_and_open_arguments() {
        let config = TruncationConfig::default();
        let mut cut = facts("The answer is", &[]);
        cut.completion_signal = false;
        cut.after_tool_result = false;
        assert_eq!(
            detect(&cut, &config),
            Some(TruncationKind::MissingCompletionSignal)
        );

        let calls = vec![ToolCall {
            id: "tooluse_1".to_string(),
            name: "write_file".to_string(),
            arguments: r#"{"path":"a.rs","content":"fn main() {"#.to_string(),
        }];
        assert_eq!(
            detect(&facts("", &calls), &config),
            Some(TruncationKind::UnbalancedToolArguments)
        );
    }

    #[test]
    fn argument_balance() {
        assert!(!arguments_unbalanced(r#"{"a":[1,2]}"#));
        assert!(!arguments_unbalanced(""));
        assert!(arguments_unbalanced(r#"{"a":[1,2"#));
        assert!(arguments_unbalanced(r#"{"a":"unterminated}"#));
    }

    #[test]
    fn ledger_notices_are_one_shot() {
        let ledger = TruncationLedger::new(8);
        ledger.record_tool("call_9", "write_file", TruncationKind::UnbalancedToolArguments);
        ledger.record_content("Here is the plan: first", TruncationKind::MissingCompletionSignal);

        let conversation = vec![
            Message::text(Role::User, "go"),
            Message::text(Role::Assistant, "Here is the plan: first"),
            Message {
                role: Role::Tool,
                parts: vec![ContentPart::ToolResult(ToolResult {
                    tool_call_id: "call_9".to_string(),
                    content: "error: invalid json".to_string(),
                    is_error: true,
                })],
            },
        ];
        let (annotated, added) = ledger.annotate(conversation.clone());
        assert_eq!(added, 2);
        assert_eq!(annotated.len(), 4);
        assert_eq!(annotated[2].text_content(), CONTINUATION_PROMPT);
        let ContentPart::ToolResult(result) = &annotated[3].parts[0] else {
            panic!("tool result expected");
        };
        assert!(result.content.contains("write_file"));
        assert!(result.content.ends_with("error: invalid json"));

        let (again, added) = ledger.annotate(conversation);
        assert_eq!(added, 0);
        assert_eq!(again.len(), 3);
        assert!(ledger.is_empty());
    }

    #[test]
    fn ledger_is_bounded() {
        let ledger = TruncationLedger::new(2);
        for id in ["a", "b", "c"] {
            ledger.record_tool(id, "t", TruncationKind::UnbalancedToolArguments);
        }
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn content_key_ignores_inline_reasoning() {
        assert_eq!(
            content_key("<think>\nhmm\n</think>\nHello there"),
            content_key("Hello there")
        );
    }

    #[test]
    fn stitch_drops_repeated_overlap() {
        assert_eq!(
            stitch("The quick brown fox", "brown fox jumps"),
            "The quick brown fox jumps"
        );
        assert_eq!(stitch("abc", "def"), "abcdef");
    }
}
