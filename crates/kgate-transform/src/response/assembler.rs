use std::collections::HashMap;

use kgate_protocol::ReasoningMode;
use kgate_protocol::kiro::KiroEvent;

use crate::conversation::ToolCall;
use crate::reasoning::{ReasoningParser, ReasoningRenderer, Segment};
use crate::response::ReplyEvent;

/// What the upstream produced, for finish-reason and usage decisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplySummary {
    /// Answer text with reasoning removed.
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub completion_signal: bool,
    pub context_usage: Option<f64>,
    pub content_events: usize,
}

impl ReplySummary {
    pub fn produced_output(&self) -> bool {
        !self.content.is_empty() || !self.reasoning.is_empty() || !self.tool_calls.is_empty()
    }

    /// Everything the model generated, for completion token counting.
    pub fn generated_text(&self) -> String {
        let mut text = String::with_capacity(self.content.len() + self.reasoning.len());
        text.push_str(&self.reasoning);
        text.push_str(&self.content);
        for call in &self.tool_calls {
            text.push_str(&call.name);
            text.push_str(&call.arguments);
        }
        text
    }
}

/// Folds decoded upstream events into protocol-neutral reply events.
#[derive(Debug)]
pub struct ReplyAssembler {
    parser: ReasoningParser,
    renderer: ReasoningRenderer,
    tool_indexes: HashMap<String, usize>,
    summary: ReplySummary,
}

impl ReplyAssembler {
    pub fn new(mode: ReasoningMode) -> Self {
        Self {
            parser: ReasoningParser::default(),
            renderer: ReasoningRenderer::new(mode),
            tool_indexes: HashMap::new(),
            summary: ReplySummary::default(),
        }
    }

    pub fn summary(&self) -> &ReplySummary {
        &self.summary
    }

    /// Exceptions and unknown events are the caller's concern and yield nothing.
    pub fn push(&mut self, event: KiroEvent) -> Vec<ReplyEvent> {
        let mut out = Vec::new();
        match event {
            KiroEvent::Text(text) => {
                self.summary.content_events += 1;
                let segments = self.parser.push(&text);
                self.emit_segments(segments, &mut out);
            }
            KiroEvent::ToolUse {
                tool_use_id,
                name,
                input,
                ..
            } => {
                self.summary.content_events += 1;
                // A partial tag cannot span a tool call.
                let segments = self.parser.flush();
                self.emit_segments(segments, &mut out);
                self.tool_event(tool_use_id, name, input, &mut out);
            }
            KiroEvent::ContextUsage(percentage) => {
                self.summary.context_usage = Some(percentage);
                self.summary.completion_signal = true;
            }
            KiroEvent::Metering(_) | KiroEvent::MessageStop => {
                self.summary.completion_signal = true;
            }
            KiroEvent::Exception { .. } | KiroEvent::Unknown => {}
        }
        out
    }

    /// Flushes buffered tag text. Call once, before emitting the finish event.
    pub fn finish(mut self) -> (Vec<ReplyEvent>, ReplySummary) {
        let mut out = Vec::new();
        let segments = self.parser.flush();
        self.emit_segments(segments, &mut out);
        if let Some(Segment::Content(text)) = self.renderer.finish() {
            out.push(ReplyEvent::Text(text));
        }
        (out, self.summary)
    }

    fn emit_segments(&mut self, segments: Vec<Segment>, out: &mut Vec<ReplyEvent>) {
        for segment in segments {
            match &segment {
                Segment::Content(text) => self.summary.content.push_str(text),
                Segment::Reasoning(text) => self.summary.reasoning.push_str(text),
            }
            match self.renderer.render(segment) {
                Some(Segment::Content(text)) => out.push(ReplyEvent::Text(text)),
                Some(Segment::Reasoning(text)) => out.push(ReplyEvent::Reasoning(text)),
                None => {}
            }
        }
    }

    fn tool_event(
        &mut self,
        tool_use_id: String,
        name: String,
        input: Option<String>,
        out: &mut Vec<ReplyEvent>,
    ) {
        let index = match self.tool_indexes.get(&tool_use_id) {
            Some(index) => *index,
            None => {
                let index = self.summary.tool_calls.len();
                self.tool_indexes.insert(tool_use_id.clone(), index);
                self.summary.tool_calls.push(ToolCall {
                    id: tool_use_id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
                out.push(ReplyEvent::ToolCallStart {
                    index,
                    id: tool_use_id,
                    name,
                });
                index
            }
        };
        if let Some(fragment) = input.filter(|fragment| !fragment.is_empty()) {
            self.summary.tool_calls[index].arguments.push_str(&fragment);
            out.push(ReplyEvent::ToolCallArguments { index, fragment });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tool(id: &str, input: Option<&str>, stop: bool) -> KiroEvent {
        KiroEvent::ToolUse {
            tool_use_id: id.to_string(),
            name: "read_file".to_string(),
            input: input.map(str::to_string),
            stop,
        }
    }

    #[test]
    fn separates_reasoning_and_streams_tool_calls_in_order() {
        let mut assembler = ReplyAssembler::new(ReasoningMode::ReasoningContent);
        let mut events = Vec::new();
        for event in [
            KiroEvent::Text("<think".to_string()),
            KiroEvent::Text("ing>plan</thinking>\n\nok".to_string()),
            tool("t1", Some("{\"path\":"), false),
            tool("t1", Some("\"a.rs\"}"), false),
            tool("t1", None, true),
            KiroEvent::ContextUsage(12.5),
        ] {
            events.extend(assembler.push(event));
        }
        let (tail, summary) = assembler.finish();
        events.extend(tail);

        assert_eq!(
            events,
            vec![
                ReplyEvent::Reasoning("plan".to_string()),
                ReplyEvent::Text("ok".to_string()),
                ReplyEvent::ToolCallStart {
                    index: 0,
                    id: "t1".to_string(),
                    name: "read_file".to_string(),
                },
                ReplyEvent::ToolCallArguments {
                    index: 0,
                    fragment: "{\"path\":".to_string(),
                },
                ReplyEvent::ToolCallArguments {
                    index: 0,
                    fragment: "\"a.rs\"}".to_string(),
                },
            ]
        );
        assert!(summary.completion_signal);
        assert_eq!(summary.context_usage, Some(12.5));
        assert_eq!(summary.tool_calls[0].arguments, "{\"path\":\"a.rs\"}");
        assert_eq!(summary.content, "ok");
    }

    #[test]
    fn content_mode_closes_dangling_think_block() {
        let mut assembler = ReplyAssembler::new(ReasoningMode::Content);
        let mut events = assembler.push(KiroEvent::Text("<thinking>still going".to_string()));
        let (tail, summary) = assembler.finish();
        events.extend(tail);
        assert_eq!(
            events,
            vec![
                ReplyEvent::Text("<think>\nstill going".to_string()),
                ReplyEvent::Text("\n</think>\n".to_string()),
            ]
        );
        assert!(!summary.completion_signal);
        assert!(summary.produced_output());
    }
}
