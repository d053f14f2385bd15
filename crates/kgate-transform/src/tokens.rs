//! Token counting for usage reporting and size estimates.

use tiktoken_rs::{CoreBPE, cl100k_base_singleton};

use crate::conversation::{ChatRequest, ContentPart, ImagePart};

/// Fixed per-message framing cost, as in OpenAI's chat token accounting.
const MESSAGE_OVERHEAD: u32 = 4;
const IMAGE_CHARS_PER_TOKEN: usize = 4;

fn bpe() -> &'static CoreBPE {
    cl100k_base_singleton()
}

/// Loads the encoder outside the request path.
pub fn preload() {
    let _ = bpe();
}

pub fn count_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    u32::try_from(bpe().encode_ordinary(text).len()).unwrap_or(u32::MAX)
}

/// Prompt tokens of a request, including tool definitions.
pub fn count_request(request: &ChatRequest) -> u32 {
    let mut total: u32 = 0;
    for message in &request.messages {
        total = total.saturating_add(MESSAGE_OVERHEAD);
        for part in &message.parts {
            let tokens = match part {
                ContentPart::Text(text) | ContentPart::Reasoning(text) => count_text(text),
                ContentPart::ToolCall(call) => {
                    count_text(&call.name).saturating_add(count_text(&call.arguments))
                }
                ContentPart::ToolResult(result) => count_text(&result.content),
                ContentPart::Image(image) => image_tokens(image),
            };
            total = total.saturating_add(tokens);
        }
    }
    for tool in &request.tools {
        total = total
            .saturating_add(count_text(&tool.name))
            .saturating_add(count_text(&tool.description))
            .saturating_add(count_text(&tool.parameters.to_string()));
    }
    total
}

/// Base64 payloads tokenize at roughly four characters per token.
pub fn image_tokens(image: &ImagePart) -> u32 {
    u32::try_from(image.data.len().div_ceil(IMAGE_CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Prompt tokens derived from the upstream's context-usage percentage.
pub fn from_context_usage(percentage: f64, max_input_tokens: u32) -> Option<u32> {
    if !percentage.is_finite() || percentage <= 0.0 || max_input_tokens == 0 {
        return None;
    }
    let tokens = (percentage / 100.0 * f64::from(max_input_tokens)).round();
    Some(tokens.min(f64::from(u32::MAX)) as u32)
}

/// Cheap character-ratio estimate used while compressing.
pub fn estimate(chars: usize, chars_per_token: f64) -> usize {
    if chars == 0 {
        return 0;
    }
    let ratio = if chars_per_token > 0.0 { chars_per_token } else { 1.0 };
    (chars as f64 / ratio).ceil() as usize
}
