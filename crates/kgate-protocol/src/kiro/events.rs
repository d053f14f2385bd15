use serde_json::Value as JsonValue;

use crate::kiro::event_stream::{EventStreamDecoder, Frame, FrameError};

/// One decoded unit of upstream output.
#[derive(Debug, Clone, PartialEq)]
pub enum KiroEvent {
    Text(String),
    ToolUse {
        tool_use_id: String,
        name: String,
        /// Fragment of the JSON-encoded input.
        input: Option<String>,
        stop: bool,
    },
    ContextUsage(f64),
    Metering(f64),
    MessageStop,
    Exception {
        kind: String,
        message: String,
    },
    Unknown,
}

impl KiroEvent {
    /// Usage, context-usage and stop events all mean the upstream finished normally.
    pub fn is_completion_signal(&self) -> bool {
        matches!(
            self,
            KiroEvent::ContextUsage(_) | KiroEvent::Metering(_) | KiroEvent::MessageStop
        )
    }
}

/// Frame decoder plus event classification.
#[derive(Debug, Default)]
pub struct KiroEventDecoder {
    frames: EventStreamDecoder,
    last_text: Option<String>,
}

impl KiroEventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<KiroEvent>, FrameError> {
        let frames = self.frames.push(chunk)?;
        let mut events = Vec::with_capacity(frames.len());
        for frame in frames {
            let event = classify_frame(&frame);
            if let KiroEvent::Text(text) = &event {
                // The upstream occasionally repeats a content event verbatim.
                if self.last_text.as_deref() == Some(text.as_str()) {
                    continue;
                }
                self.last_text = Some(text.clone());
            }
            events.push(event);
        }
        Ok(events)
    }
}

pub fn classify_frame(frame: &Frame) -> KiroEvent {
    let value: JsonValue = serde_json::from_slice(&frame.payload).unwrap_or(JsonValue::Null);
    if frame.message_type() == Some("exception") || frame.message_type() == Some("error") {
        let kind = frame
            .header_str(":exception-type")
            .or_else(|| frame.header_str(":error-code"))
            .unwrap_or("UnknownException")
            .to_string();
        let message = value
            .get("message")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).into_owned());
        return KiroEvent::Exception { kind, message };
    }
    match frame.event_type() {
        Some("messageStopEvent") => KiroEvent::MessageStop,
        _ => classify_payload(&value),
    }
}

/// Classifies a payload by its keys. Order matters: tool events carry both
/// `input` and `name`, and a stop flag may accompany either.
pub fn classify_payload(value: &JsonValue) -> KiroEvent {
    let tool_use_id = value.get("toolUseId").and_then(JsonValue::as_str);
    let name = value.get("name").and_then(JsonValue::as_str);
    if let (Some(tool_use_id), Some(name)) = (tool_use_id, name) {
        return KiroEvent::ToolUse {
            tool_use_id: tool_use_id.to_string(),
            name: name.to_string(),
            input: value
                .get("input")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            stop: value
                .get("stop")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
        };
    }
    if value.get("stop").and_then(JsonValue::as_bool) == Some(true) {
        return KiroEvent::MessageStop;
    }
    if let Some(usage) = value.get("usage").and_then(JsonValue::as_f64) {
        return KiroEvent::Metering(usage);
    }
    if let Some(percentage) = value
        .get("contextUsagePercentage")
        .and_then(JsonValue::as_f64)
    {
        return KiroEvent::ContextUsage(percentage);
    }
    if let Some(content) = value.get("content").and_then(JsonValue::as_str) {
        return KiroEvent::Text(content.to_string());
    }
    KiroEvent::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kiro::event_stream::encode_frame;

    fn event(kind: &str, payload: &str) -> Vec<u8> {
        encode_frame(
            &[(":event-type", kind), (":message-type", "event")],
            payload.as_bytes(),
        )
        .to_vec()
    }

    #[test]
    fn classifies_a_typical_stream() {
        let mut wire = Vec::new();
        wire.extend(event("assistantResponseEvent", r#"{"content":"Hel"}"#));
        wire.extend(event("assistantResponseEvent", r#"{"content":"Hel"}"#));
        wire.extend(event("assistantResponseEvent", r#"{"content":"lo"}"#));
        wire.extend(event(
            "toolUseEvent",
            r#"{"name":"read","toolUseId":"t1","input":"{\"pa"}"#,
        ));
        wire.extend(event(
            "toolUseEvent",
            r#"{"name":"read","toolUseId":"t1","stop":true}"#,
        ));
        wire.extend(event("contextUsageEvent", r#"{"contextUsagePercentage":12.5}"#));

        let mut decoder = KiroEventDecoder::new();
        let events = decoder.push(&wire).unwrap();
        assert_eq!(
            events,
            vec![
                KiroEvent::Text("Hel".to_string()),
                KiroEvent::Text("lo".to_string()),
                KiroEvent::ToolUse {
                    tool_use_id: "t1".to_string(),
                    name: "read".to_string(),
                    input: Some("{\"pa".to_string()),
                    stop: false,
                },
                KiroEvent::ToolUse {
                    tool_use_id: "t1".to_string(),
                    name: "read".to_string(),
                    input: None,
                    stop: true,
                },
                KiroEvent::ContextUsage(12.5),
            ]
        );
        assert!(events[4].is_completion_signal());
    }

    #[test]
    fn exception_frames_surface_their_message() {
        let wire = encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "ThrottlingException"),
            ],
            br#"{"message":"slow down"}"#,
        );
        let events = KiroEventDecoder::new().push(&wire).unwrap();
        assert_eq!(
            events,
            vec![KiroEvent::Exception {
                kind: "ThrottlingException".to_string(),
                message: "slow down".to_string(),
            }]
        );
    }
}
