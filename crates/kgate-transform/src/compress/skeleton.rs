//! Regex-driven outline of source text: imports, signatures and comments
//! survive, bodies collapse to a line count.

use std::sync::OnceLock;

use regex::{Regex, RegexSet};

fn signatures() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"^(async\s+)?def\s+\w+\s*\(",
            r"^class\s+\w+.*:",
            r"^(export\s+)?(default\s+)?(async\s+)?function\s+\w+",
            r"^(export\s+)?(const|let|var)\s+\w+\s*=\s*(async\s+)?\(",
            r"^(export\s+)?(abstract\s+)?class\s+\w+",
            r"^(export\s+)?(interface|type|enum)\s+\w+",
            r"^(public|private|protected|static|final|abstract|override|virtual|async)\s+",
            r"^func\s+",
            r"^type\s+\w+\s+(struct|interface)",
            r"^(pub(\([^)]*\))?\s+)?(async\s+)?(unsafe\s+)?fn\s+\w+",
            r"^(pub(\([^)]*\))?\s+)?(struct|enum|trait|mod)\s+\w+",
            r"^impl\b",
        ])
        .unwrap_or_else(|err| panic!("valid signature patterns: {err}"))
    })
}

fn imports() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"^(import|from)\s+",
            r"^(const|let|var)\s+.*require\(",
            r"^#include\s+",
            r"^using\s+",
            r"^package\s+",
            r"^(pub\s+)?use\s+",
        ])
        .unwrap_or_else(|err| panic!("valid import patterns: {err}"))
    })
}

fn decorator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(@\w+|#\[)").unwrap_or_else(|err| panic!("valid decorator regex: {err}"))
    })
}

fn line_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*\d+\|").unwrap_or_else(|err| panic!("valid line number regex: {err}"))
    })
}

pub fn is_signature(trimmed: &str) -> bool {
    signatures().is_match(trimmed)
}

pub fn is_import(trimmed: &str) -> bool {
    imports().is_match(trimmed)
}

/// `  12|code` -> `code`, as produced by file-reading tools.
pub fn strip_line_number(line: &str) -> &str {
    match line_number().find(line) {
        Some(found) => &line[found.end()..],
        None => line,
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Scores the first 30 lines for code-like landmarks.
pub fn looks_like_code(text: &str) -> bool {
    let mut score = 0;
    for line in text.lines().take(30) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if line_number().is_match(trimmed) {
            score += 2;
        }
        let code = strip_line_number(trimmed).trim();
        if ["{", "}", "()", "=>", "->", "::", ";"]
            .iter()
            .any(|marker| code.contains(marker))
        {
            score += 1;
        }
        if is_import(code) || is_signature(code) {
            score += 2;
        }
    }
    score >= 5
}

pub fn skeletonize(text: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut skip_body = false;
    let mut body_indent = 0;
    let mut skipped = 0usize;
    let mut in_header = true;

    let elided = |indent: usize, count: usize| format!("{}    // ... ({count} lines)", " ".repeat(indent));

    for line in text.split('\n') {
        let code = strip_line_number(line);
        let trimmed = code.trim();

        if trimmed.is_empty() {
            if in_header || !skip_body {
                kept.push(line.to_string());
            }
            continue;
        }
        if is_import(trimmed) {
            kept.push(line.to_string());
            continue;
        }
        if decorator().is_match(trimmed) {
            in_header = false;
            if skip_body && skipped > 0 {
                kept.push(elided(body_indent, skipped));
                skipped = 0;
            }
            skip_body = false;
            kept.push(line.to_string());
            continue;
        }
        if is_signature(trimmed) {
            in_header = false;
            if skip_body && skipped > 0 {
                kept.push(elided(body_indent, skipped));
                skipped = 0;
            }
            skip_body = true;
            body_indent = indent_of(code);
            kept.push(line.to_string());
            continue;
        }
        let is_comment = ["#", "//", "/*", "*", "'''", "\"\"\""]
            .iter()
            .any(|prefix| trimmed.starts_with(prefix));
        if is_comment {
            if !skip_body {
                kept.push(line.to_string());
            }
            continue;
        }
        if skip_body {
            if indent_of(code) <= body_indent {
                if skipped > 0 {
                    kept.push(elided(body_indent, skipped));
                    skipped = 0;
                }
                skip_body = false;
                kept.push(line.to_string());
            } else {
                skipped += 1;
            }
            continue;
        }
        in_header = false;
        kept.push(line.to_string());
    }
    if skip_body && skipped > 0 {
        kept.push(elided(body_indent, skipped));
    }
    kept.join("\n")
}

/// Skeleton of `text` when it is code and the outline is meaningfully shorter.
pub fn skeletonize_code(text: &str, max_ratio: f64) -> Option<String> {
    if !looks_like_code(text) {
        return None;
    }
    let skeleton = skeletonize(text);
    let limit = (text.chars().count() as f64 * max_ratio) as usize;
    (skeleton.chars().count() < limit).then_some(skeleton)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = "use std::fmt;\n\npub struct Point {\n    x: i32,\n    y: i32,\n}\n\nfn area(p: &Point) -> i32 {\n    let w = p.x;\n    let h = p.y;\n    w * h\n}\n";

    #[test]
    fn keeps_landmarks_and_counts_bodies() {
        assert!(looks_like_code(SOURCE));
        assert_eq!(
            skeletonize(SOURCE),
            "use std::fmt;\n\npub struct Point {\n    // ... (2 lines)\n}\n\nfn area(p: &Point) -> i32 {\n    // ... (3 lines)\n}\n"
        );
    }

    #[test]
    fn prose_is_not_code() {
        let prose = "The quick brown fox jumps over the lazy dog.\nIt was a sunny day.\n".repeat(10);
        assert!(!looks_like_code(&prose));
        assert_eq!(skeletonize_code(&prose, 0.8), None);
    }

    #[test]
    fn line_numbers_are_recognized() {
        assert_eq!(strip_line_number("  12|fn main() {}"), "fn main() {}");
        assert!(is_signature(strip_line_number("12|fn main() {}")));
    }
}
