use std::sync::OnceLock;

use regex::Regex;

const THINKING_SUFFIX: &str = "-thinking";

fn date_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"-(?:\d{8}|latest)$")
            .unwrap_or_else(|err| panic!("valid date suffix regex: {err}"))
    })
}

fn family_first() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^claude-(opus|sonnet|haiku)-(\d{1,2})[-.](\d{1,2})$")
            .unwrap_or_else(|err| panic!("valid family-first regex: {err}"))
    })
}

fn version_first() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^claude-(\d{1,2})[-.](\d{1,2})-(opus|sonnet|haiku)$")
            .unwrap_or_else(|err| panic!("valid version-first regex: {err}"))
    })
}

/// Lowercases, trims and splits off a trailing `-thinking`.
pub fn split_thinking(name: &str) -> (String, bool) {
    let lowered = name.trim().to_ascii_lowercase();
    match lowered.strip_suffix(THINKING_SUFFIX) {
        Some(base) if !base.is_empty() => (base.to_string(), true),
        _ => (lowered, false),
    }
}

pub fn with_thinking(model: &str) -> String {
    format!("{model}{THINKING_SUFFIX}")
}

/// Folds vendor spelling variants onto one id:
/// `Claude_Opus_4.6`, `claude-opus-4-6` and `claude-opus-4.6-20260101`
/// all become `claude-opus-4.6`.
pub fn canonical(name: &str) -> String {
    let mut folded = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        let ch = match ch {
            '_' | ' ' => '-',
            other => other.to_ascii_lowercase(),
        };
        if ch == '-' && folded.ends_with('-') {
            continue;
        }
        folded.push(ch);
    }
    let folded = date_suffix().replace(&folded, "").into_owned();

    if let Some(caps) = family_first().captures(&folded) {
        return format!("claude-{}-{}.{}", &caps[1], &caps[2], &caps[3]);
    }
    if let Some(caps) = version_first().captures(&folded) {
        return format!("claude-{}.{}-{}", &caps[1], &caps[2], &caps[3]);
    }
    folded
}

/// Whether `name` is a versioned Claude id in canonical spelling.
pub fn is_versioned_family(name: &str) -> bool {
    family_first().is_match(name) || version_first().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_spelling_variants() {
        for input in [
            "claude-opus-4-6",
            "claude-opus-4.6-20260101",
            "Claude_Opus_4.6",
            "  CLAUDE--OPUS-4.6 ",
            "claude-opus-4-6-latest",
        ] {
            assert_eq!(canonical(input), "claude-opus-4.6", "{input}");
        }
        assert_eq!(canonical("claude-3-7-sonnet-20250219"), "claude-3.7-sonnet");
        assert_eq!(canonical("claude-sonnet-4-20250514"), "claude-sonnet-4");
        assert_eq!(canonical("auto"), "auto");
    }

    #[test]
    fn canonical_is_idempotent() {
        for input in ["claude-haiku-4-5", "gpt-4o", "claude-3-5-sonnet"] {
            let once = canonical(input);
            assert_eq!(canonical(&once), once);
        }
    }

    #[test]
    fn thinking_suffix_split() {
        assert_eq!(
            split_thinking("Kiro-Opus-4-6-Thinking"),
            ("kiro-opus-4-6".to_string(), true)
        );
        assert_eq!(split_thinking("-thinking"), ("-thinking".to_string(), false));
    }
}
