//! Lossy text rewrites shared by the compression phases.

use serde_json::Value as JsonValue;

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Keeps `keep_ratio` of the characters, 60% from the head and the rest
/// from the tail, with an elision marker in between.
pub fn head_tail(text: &str, keep_ratio: f64) -> String {
    let total = char_len(text);
    let keep = (total as f64 * keep_ratio.clamp(0.0, 1.0)) as usize;
    if keep >= total {
        return text.to_string();
    }
    let head = keep * 6 / 10;
    let tail = keep - head;
    let omitted = total - head - tail;
    let head_text: String = text.chars().take(head).collect();
    let tail_text: String = text.chars().skip(total - tail).collect();
    format!("{head_text}\n\n... [{omitted} chars omitted] ...\n\n{tail_text}")
}

/// Trailing whitespace removed and blank-line runs collapsed to one.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for (index, line) in text.split('\n').enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if index > 0 {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

const DECISION_MARKERS: &[&str] = &[
    "created", "modified", "deleted", "updated", "renamed", "installed", "deployed",
    "configured", "fixed", "added", "removed", ".rs", ".py", ".ts", ".tsx", ".js", ".json",
    ".yaml", ".yml", ".toml", ".md", ".sql", ".sh", "##", "- ", "* ", "1.", "2.", "3.",
];

fn is_decision_line(line: &str) -> bool {
    DECISION_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Condenses a long assistant reply to its decision lines. Code blocks keep
/// their first three lines.
pub fn decision_summary(content: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut fence_lines = 0;
    let mut fence_elided = false;

    for line in content.split('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            if in_fence && fence_elided {
                kept.push("// ... [code block omitted] ...");
            }
            if in_fence {
                kept.push(line);
            }
            in_fence = !in_fence;
            fence_lines = 0;
            fence_elided = false;
            if in_fence {
                kept.push(line);
            }
            continue;
        }
        if in_fence {
            if fence_lines < 3 {
                kept.push(line);
                fence_lines += 1;
            } else {
                fence_elided = true;
            }
            continue;
        }
        if is_decision_line(trimmed) || char_len(trimmed) < 100 {
            kept.push(line);
        }
    }

    let summary = kept.join("\n");
    let total = char_len(content);
    if char_len(&summary) * 100 < total * 15 {
        let head: String = content.chars().take(total * 3 / 10).collect();
        return format!("{head}\n\n... [earlier response truncated] ...");
    }
    summary
}

const BULKY_ARGUMENT_FIELDS: &[&str] = &[
    "old_string", "new_string", "old_str", "new_str", "content", "file_text", "code", "text",
    "diff", "patch",
];

/// Shortens bulky string fields of a JSON tool-call argument object.
pub fn fold_arguments(arguments: &str, min_field_chars: usize) -> Option<String> {
    let JsonValue::Object(mut object) = serde_json::from_str::<JsonValue>(arguments).ok()? else {
        return None;
    };
    let mut changed = false;
    for field in BULKY_ARGUMENT_FIELDS {
        if let Some(JsonValue::String(value)) = object.get_mut(*field) {
            let total = char_len(value);
            if total > min_field_chars {
                let head: String = value.chars().take(60).collect();
                let tail: String = value.chars().skip(total - 60).collect();
                *value = format!("{head} ... [{total} chars] ... {tail}");
                changed = true;
            }
        }
    }
    if !changed {
        return None;
    }
    serde_json::to_string(&JsonValue::Object(object)).ok()
}
