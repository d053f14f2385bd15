//! Decoded upstream events for one attempt, with the first-token and idle guards.

use std::mem;
use std::time::Duration;

use kgate_protocol::kiro::{KiroEvent, KiroEventDecoder};
use tokio::time::Instant;

use crate::upstream::{UpstreamError, UpstreamStream};

/// Why an attempt produced nothing worth forwarding.
#[derive(Debug)]
pub(crate) enum PrimeError {
    /// No content before the first-token deadline.
    Stalled(Duration),
    /// The stream closed with neither content nor a completion signal.
    Empty,
    Upstream(UpstreamError),
}

fn is_content(event: &KiroEvent) -> bool {
    matches!(event, KiroEvent::Text(_) | KiroEvent::ToolUse { .. })
}

pub(crate) struct UpstreamEvents {
    rx: UpstreamStream,
    decoder: KiroEventDecoder,
    pending: Vec<KiroEvent>,
    idle: Duration,
    ended: bool,
}

impl UpstreamEvents {
    /// Reads until the first content event, so failures before anything
    /// reaches the caller can still fail over.
    pub(crate) async fn prime(
        rx: UpstreamStream,
        first_token: Duration,
        idle: Duration,
    ) -> Result<Self, PrimeError> {
        let mut events = Self {
            rx,
            decoder: KiroEventDecoder::new(),
            pending: Vec::new(),
            idle,
            ended: false,
        };
        let deadline = Instant::now() + first_token;
        loop {
            let next = tokio::time::timeout_at(deadline, events.rx.recv())
                .await
                .map_err(|_| PrimeError::Stalled(first_token))?;
            match next {
                None => {
                    events.ended = true;
                    let settled = events
                        .pending
                        .iter()
                        .any(|event| is_content(event) || event.is_completion_signal());
                    return if settled {
                        Ok(events)
                    } else {
                        Err(PrimeError::Empty)
                    };
                }
                Some(Err(err)) if err.is_stall() => return Err(PrimeError::Stalled(first_token)),
                Some(Err(err)) => return Err(PrimeError::Upstream(err)),
                Some(Ok(chunk)) => {
                    let decoded = events.decoder.push(&chunk).map_err(|err| {
                        PrimeError::Upstream(UpstreamError::Decode(err.to_string()))
                    })?;
                    for event in decoded {
                        if let KiroEvent::Exception { kind, message } = event {
                            return Err(PrimeError::Upstream(UpstreamError::Exception {
                                kind,
                                message,
                            }));
                        }
                        events.pending.push(event);
                    }
                    if events.pending.iter().any(is_content) {
                        return Ok(events);
                    }
                }
            }
        }
    }

    /// Next batch of events in arrival order. `None` once the stream closed.
    /// A read failure or an idle gap ends the stream with an error.
    pub(crate) async fn next(&mut self) -> Option<Result<Vec<KiroEvent>, UpstreamError>> {
        if !self.pending.is_empty() {
            return Some(Ok(mem::take(&mut self.pending)));
        }
        while !self.ended {
            let item = match tokio::time::timeout(self.idle, self.rx.recv()).await {
                Ok(item) => item,
                Err(_) => {
                    self.ended = true;
                    return Some(Err(UpstreamError::Stalled(self.idle)));
                }
            };
            match item {
                None => self.ended = true,
                Some(Err(err)) => {
                    self.ended = true;
                    return Some(Err(err));
                }
                Some(Ok(chunk)) => match self.decoder.push(&chunk) {
                    Ok(events) if events.is_empty() => {}
                    Ok(events) => return Some(Ok(events)),
                    Err(err) => {
                        self.ended = true;
                        return Some(Err(UpstreamError::Decode(err.to_string())));
                    }
                },
            }
        }
        None
    }
}
