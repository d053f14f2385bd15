//! Streaming separation of `<thinking>` blocks from answer text.
//!
//! The parser never emits a byte that could still turn out to be part of a
//! tag, so its output does not depend on where chunk boundaries fall. A block
//! only opens while nothing but whitespace has been answered; later tags are
//! answer text.

use kgate_protocol::ReasoningMode;

pub const DEFAULT_OPEN_TAGS: &[&str] = &["<thinking>", "<think>"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Outside,
    /// A suffix of the input is a proper prefix of an open tag.
    MaybeOpen,
    InsideReasoning,
    /// A suffix of the input is a proper prefix of the close tag.
    MaybeClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Content(String),
    Reasoning(String),
}

impl Segment {
    pub fn text(&self) -> &str {
        match self {
            Segment::Content(text) | Segment::Reasoning(text) => text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReasoningParser {
    open_tags: Vec<String>,
    close_tag: Option<String>,
    pending: String,
    state: ParserState,
    reasoning_started: bool,
    after_close: bool,
    answer_started: bool,
}

impl Default for ReasoningParser {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_TAGS.iter().map(|tag| tag.to_string()).collect())
    }
}

impl ReasoningParser {
    /// `open_tags` like `<thinking>`; each closes with its `</...>` twin.
    pub fn new(open_tags: Vec<String>) -> Self {
        Self {
            open_tags,
            close_tag: None,
            pending: String::new(),
            state: ParserState::Outside,
            reasoning_started: false,
            after_close: false,
            answer_started: false,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.push_str(chunk);

        loop {
            match self.close_tag.clone() {
                None => {
                    let rest = buffer.trim_start();
                    let lead = buffer.len() - rest.len();
                    if !self.answer_started {
                        let opened = self
                            .open_tags
                            .iter()
                            .find(|tag| rest.starts_with(tag.as_str()))
                            .cloned();
                        if let Some(tag) = opened {
                            self.content(&buffer[..lead], &mut out);
                            self.close_tag = Some(close_for(&tag));
                            buffer.drain(..lead + tag.len());
                            continue;
                        }
                        if self.open_tags.iter().any(|tag| tag.starts_with(rest)) {
                            self.pending = rest.to_string();
                            self.state = if rest.is_empty() {
                                ParserState::Outside
                            } else {
                                ParserState::MaybeOpen
                            };
                            self.content(&buffer[..lead], &mut out);
                            break;
                        }
                    }
                    self.answer_started = true;
                    self.content(&buffer, &mut out);
                    self.state = ParserState::Outside;
                    break;
                }
                Some(close) => match buffer.find(close.as_str()) {
                    Some(at) => {
                        self.reasoning(&buffer[..at], &mut out);
                        self.close_tag = None;
                        self.after_close = true;
                        buffer.drain(..at + close.len());
                    }
                    None => {
                        let keep = partial_suffix(&buffer, std::iter::once(close.as_str()));
                        let split = buffer.len() - keep;
                        self.reasoning(&buffer[..split], &mut out);
                        self.pending = buffer[split..].to_string();
                        self.state = if keep > 0 {
                            ParserState::MaybeClose
                        } else {
                            ParserState::InsideReasoning
                        };
                        break;
                    }
                },
            }
        }
        out
    }

    /// Releases any buffered partial tag verbatim on its current channel.
    pub fn flush(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        if self.close_tag.is_some() {
            self.reasoning(&pending, &mut out);
        } else {
            self.content(&pending, &mut out);
        }
        self.state = if self.close_tag.is_some() {
            ParserState::InsideReasoning
        } else {
            ParserState::Outside
        };
        out
    }

    fn content(&mut self, text: &str, out: &mut Vec<Segment>) {
        let text = if self.after_close {
            let trimmed = text.trim_start_matches(['\n', '\r']);
            if trimmed.is_empty() {
                return;
            }
            self.after_close = false;
            trimmed
        } else {
            text
        };
        if !text.is_empty() {
            out.push(Segment::Content(text.to_string()));
        }
    }

    fn reasoning(&mut self, text: &str, out: &mut Vec<Segment>) {
        let text = if self.reasoning_started {
            text
        } else {
            let trimmed = text.trim_start_matches(['\n', '\r']);
            if trimmed.is_empty() {
                return;
            }
            self.reasoning_started = true;
            trimmed
        };
        if !text.is_empty() {
            out.push(Segment::Reasoning(text.to_string()));
        }
    }
}

fn close_for(open: &str) -> String {
    format!("</{}", open.trim_start_matches('<'))
}

/// Length of the longest buffer suffix that is a proper prefix of any tag.
fn partial_suffix<'a>(buffer: &str, tags: impl Iterator<Item = &'a str>) -> usize {
    let mut best = 0;
    for tag in tags {
        let max = tag.len().saturating_sub(1).min(buffer.len());
        for len in (best + 1..=max).rev() {
            if buffer.is_char_boundary(buffer.len() - len)
                && tag.starts_with(&buffer[buffer.len() - len..])
            {
                best = len;
                break;
            }
        }
    }
    best
}

/// Applies the caller's reasoning representation to parsed segments.
#[derive(Debug, Clone)]
pub struct ReasoningRenderer {
    mode: ReasoningMode,
    reasoning_open: bool,
}

impl ReasoningRenderer {
    pub const OPEN: &'static str = "<think>\n";
    pub const CLOSE: &'static str = "\n</think>\n";

    pub fn new(mode: ReasoningMode) -> Self {
        Self {
            mode,
            reasoning_open: false,
        }
    }

    pub fn render(&mut self, segment: Segment) -> Option<Segment> {
        match (self.mode, segment) {
            (ReasoningMode::Drop, Segment::Reasoning(_)) => None,
            (ReasoningMode::ReasoningContent, segment) => Some(segment),
            (ReasoningMode::Drop, segment) => Some(segment),
            (ReasoningMode::Content, Segment::Reasoning(text)) => {
                if self.reasoning_open {
                    Some(Segment::Content(text))
                } else {
                    self.reasoning_open = true;
                    Some(Segment::Content(format!("{}{text}", Self::OPEN)))
                }
            }
            (ReasoningMode::Content, Segment::Content(text)) => {
                if self.reasoning_open {
                    self.reasoning_open = false;
                    Some(Segment::Content(format!("{}{text}", Self::CLOSE)))
                } else {
                    Some(Segment::Content(text))
                }
            }
        }
    }

    /// Closes a `<think>` block left open at end of stream.
    pub fn finish(&mut self) -> Option<Segment> {
        if self.mode == ReasoningMode::Content && self.reasoning_open {
            self.reasoning_open = false;
            return Some(Segment::Content(Self::CLOSE.to_string()));
        }
        None
    }
}

/// Non-stream form of the renderer.
pub fn render_complete(mode: ReasoningMode, reasoning: &str, content: &str) -> (Option<String>, String) {
    match mode {
        ReasoningMode::Drop => (None, content.to_string()),
        ReasoningMode::ReasoningContent => (
            (!reasoning.is_empty()).then(|| reasoning.to_string()),
            content.to_string(),
        ),
        ReasoningMode::Content if reasoning.is_empty() => (None, content.to_string()),
        ReasoningMode::Content => (None, format!("<think>\n{reasoning}\n</think>\n{content}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
        let mut out: Vec<Segment> = Vec::new();
        for segment in segments {
            match (out.last_mut(), segment) {
                (Some(Segment::Content(last)), Segment::Content(text))
                | (Some(Segment::Reasoning(last)), Segment::Reasoning(text)) => {
                    last.push_str(&text)
                }
                (_, segment) => out.push(segment),
            }
        }
        out
    }

    fn run(chunks: &[&str]) -> Vec<Segment> {
        let mut parser = ReasoningParser::default();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(parser.push(chunk));
        }
        out.extend(parser.flush());
        coalesce(out)
    }

    const SAMPLE: &str = "<thinking>\nstep one < two\n</thinking>\n\nAnswer <b>bold</b> <thin";

    #[test]
    fn output_is_independent_of_chunk_boundaries() {
        let whole = run(&[SAMPLE]);
        assert_eq!(
            whole,
            vec![
                Segment::Reasoning("step one < two\n".to_string()),
                Segment::Content("Answer <b>bold</b> <thin".to_string()),
            ]
        );

        let chars: Vec<char> = SAMPLE.chars().collect();
        for size in 1..=12 {
            let pieces: Vec<String> = chars.chunks(size).map(|c| c.iter().collect()).collect();
            let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
            assert_eq!(run(&refs), whole, "chunk size {size}");
        }
        for split in 0..=SAMPLE.len() {
            if SAMPLE.is_char_boundary(split) {
                assert_eq!(run(&[&SAMPLE[..split], &SAMPLE[split..]]), whole, "split {split}");
            }
        }
    }

    #[test]
    fn tags_after_answer_text_are_content() {
        let expected = vec![Segment::Content(
            "Wrap it in <think> and </think> tags".to_string(),
        )];
        assert_eq!(run(&["Wrap it in <think> and </think> tags"]), expected);
        assert_eq!(run(&["Wrap it in <thi", "nk> and </think> tags"]), expected);

        assert_eq!(
            run(&["\n <thinking>plan</thinking>\nDone, see <think>"]),
            vec![
                Segment::Content("\n ".to_string()),
                Segment::Reasoning("plan".to_string()),
                Segment::Content("Done, see <think>".to_string()),
            ]
        );
    }

    #[test]
    fn buffering_states_are_visible() {
        let mut parser = ReasoningParser::default();
        assert!(parser.push("<thi").is_empty());
        assert_eq!(parser.state(), ParserState::MaybeOpen);
        parser.push("nk>abc</th");
        assert_eq!(parser.state(), ParserState::MaybeClose);
        parser.push("ought");
        assert_eq!(parser.state(), ParserState::InsideReasoning);
    }

    #[test]
    fn failed_partial_tag_is_flushed_as_content() {
        assert_eq!(
            run(&["a <thi", "s is fine"]),
            vec![Segment::Content("a <this is fine".to_string())]
        );
    }

    #[test]
    fn content_mode_wraps_reasoning_in_think_tags() {
        let mut renderer = ReasoningRenderer::new(ReasoningMode::Content);
        let rendered: Vec<Segment> = [
            Segment::Reasoning("a".to_string()),
            Segment::Reasoning("b".to_string()),
            Segment::Content("c".to_string()),
        ]
        .into_iter()
        .filter_map(|s| renderer.render(s))
        .collect();
        assert_eq!(
            rendered,
            vec![
                Segment::Content("<think>\na".to_string()),
                Segment::Content("b".to_string()),
                Segment::Content("\n</think>\nc".to_string()),
            ]
        );
        assert_eq!(renderer.finish(), None);
    }

    #[test]
    fn drop_mode_discards_reasoning() {
        let mut renderer = ReasoningRenderer::new(ReasoningMode::Drop);
        assert_eq!(renderer.render(Segment::Reasoning("x".to_string())), None);
        assert_eq!(
            render_complete(ReasoningMode::Content, "r", "c"),
            (None, "<think>\nr\n</think>\nc".to_string())
        );
    }
}
