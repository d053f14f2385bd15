//! Structural outline of long-form markdown: headings, list items, tables
//! and code fence boundaries survive; prose and fence bodies are counted.

use std::sync::OnceLock;

use regex::Regex;

use crate::compress::skeleton::strip_line_number;

fn heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,6}\s").unwrap_or_else(|err| panic!("valid heading regex: {err}")))
}

fn list_item() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([-*+]\s|\d+\.\s)").unwrap_or_else(|err| panic!("valid list regex: {err}"))
    })
}

pub fn looks_like_markdown(text: &str) -> bool {
    let mut headings = 0;
    let mut items = 0;
    let mut lines = 0;
    for line in text.lines().take(60) {
        lines += 1;
        let trimmed = strip_line_number(line).trim();
        if heading().is_match(trimmed) {
            headings += 1;
        } else if list_item().is_match(trimmed) {
            items += 1;
        }
    }
    (headings >= 3 && items >= 3) || (headings >= 2 && headings * 33 > lines)
}

pub fn skeletonize(text: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut in_fence = false;
    let mut skipped = 0usize;

    let flush = |kept: &mut Vec<String>, skipped: &mut usize| {
        if *skipped > 0 {
            kept.push(format!("  ... [{skipped} lines] ..."));
            *skipped = 0;
        }
    };

    for raw in text.split('\n') {
        let line = strip_line_number(raw);
        let trimmed = line.trim();

        if trimmed.starts_with("```") {
            if in_fence {
                flush(&mut kept, &mut skipped);
                in_fence = false;
            } else {
                flush(&mut kept, &mut skipped);
                in_fence = true;
            }
            kept.push(line.to_string());
            continue;
        }
        if in_fence {
            skipped += 1;
            continue;
        }
        if trimmed.is_empty()
            || heading().is_match(trimmed)
            || list_item().is_match(trimmed)
            || trimmed.starts_with('|')
        {
            flush(&mut kept, &mut skipped);
            kept.push(line.to_string());
            continue;
        }
        skipped += 1;
    }
    flush(&mut kept, &mut skipped);
    kept.join("\n")
}

/// Skeleton of `text` when the outline is meaningfully shorter.
pub fn skeletonize_markdown(text: &str, max_ratio: f64) -> Option<String> {
    let skeleton = skeletonize(text);
    let limit = (text.chars().count() as f64 * max_ratio) as usize;
    (skeleton.chars().count() < limit).then_some(skeleton)
}
