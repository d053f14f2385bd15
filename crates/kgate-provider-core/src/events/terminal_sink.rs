use std::future::Future;
use std::pin::Pin;

use super::{Event, EventSink};

const REDACTED: &str = "[redacted]";

/// Writes one JSON line per event to stderr.
#[derive(Debug, Default)]
pub struct TerminalEventSink {
    redact_sensitive: bool,
}

impl TerminalEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hides free-form reasons, which may quote upstream response bodies.
    pub fn redacted(redact_sensitive: bool) -> Self {
        Self { redact_sensitive }
    }

    fn render(&self, event: &Event) -> Result<String, serde_json::Error> {
        match event {
            Event::CredentialDisabled(disabled) if self.redact_sensitive => {
                let mut disabled = disabled.clone();
                disabled.reason = REDACTED.to_string();
                serde_json::to_string(&Event::CredentialDisabled(disabled))
            }
            _ => serde_json::to_string(event),
        }
    }
}

impl EventSink for TerminalEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match self.render(event) {
                Ok(line) => eprintln!("{line}"),
                Err(err) => {
                    eprintln!("{{\"event\":\"event_serialize_error\",\"error\":\"{err}\"}}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::events::CredentialDisabledEvent;

    fn disabled() -> Event {
        Event::CredentialDisabled(CredentialDisabledEvent {
            at: SystemTime::UNIX_EPOCH,
            credential_id: 4,
            reason: "invalid_grant: token abc".to_string(),
        })
    }

    #[test]
    fn redaction_hides_reasons_only_when_enabled() {
        let plain = TerminalEventSink::new().render(&disabled()).unwrap();
        assert!(plain.contains("invalid_grant"));

        let redacted = TerminalEventSink::redacted(true).render(&disabled()).unwrap();
        assert!(!redacted.contains("invalid_grant"));
        assert!(redacted.contains(REDACTED));
        assert!(redacted.contains("\"credential_id\":4"));
    }
}
