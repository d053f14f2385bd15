//! Streaming replies: one spawned pump per request feeding a bounded channel.

use bytes::Bytes;
use kgate_protocol::kiro::KiroEvent;
use kgate_provider_core::{CredentialHandle, Outcome};
use kgate_transform::conversation::ClientProtocol;
use kgate_transform::response::{
    ClaudeStreamEncoder, OpenAIChatStreamEncoder, ReplyAssembler, ReplyEvent, StreamEncoder,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{Opened, Orchestrator, Prepared, claude_id, openai_id, unix_now};
use crate::upstream::UpstreamError;

/// The receiving side of the reply channel is gone.
struct Disconnected;

impl Orchestrator {
    pub(super) fn spawn_stream(&self, prepared: Prepared, opened: Opened) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(self.settings.stream_buffer.max(1));
        let this = self.clone();
        tokio::spawn(async move {
            this.pump(prepared, opened, tx).await;
        });
        rx
    }

    async fn pump(&self, prepared: Prepared, opened: Opened, tx: mpsc::Sender<Bytes>) {
        let Opened {
            handle,
            mut events,
            attempts,
        } = opened;
        let credential_id = handle.id();
        let mut encoder: Box<dyn StreamEncoder> = match prepared.request.protocol {
            ClientProtocol::OpenAIChat => Box::new(OpenAIChatStreamEncoder::new(
                openai_id(),
                prepared.response_model.clone(),
                unix_now(),
            )),
            ClientProtocol::AnthropicMessages => Box::new(ClaudeStreamEncoder::new(
                claude_id(),
                prepared.response_model.clone(),
                prepared.prompt_estimate,
            )),
        };
        let mut assembler = ReplyAssembler::new(prepared.mode);
        let mut stalled = false;

        let mut handle = Some(handle);
        loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => {
                    self.disconnected(&prepared, handle.take()).await;
                    return;
                }
                next = events.next() => next,
            };
            let Some(next) = next else {
                break;
            };
            let batch = match next {
                Ok(batch) => batch,
                Err(err) if err.is_stall() => {
                    warn!(
                        event = "upstream_stalled",
                        phase = "stream",
                        trace_id = %prepared.trace_id,
                        credential = credential_id,
                        model = %prepared.resolution.model,
                        reason = "idle_timeout",
                        retry = false,
                    );
                    stalled = true;
                    break;
                }
                Err(err) => {
                    self.stream_failed(&prepared, &mut handle, &err, attempts, encoder.as_mut(), &tx)
                        .await;
                    return;
                }
            };
            for event in batch {
                if let KiroEvent::Exception { kind, message } = event {
                    let err = UpstreamError::Exception { kind, message };
                    self.stream_failed(&prepared, &mut handle, &err, attempts, encoder.as_mut(), &tx)
                        .await;
                    return;
                }
                for reply_event in assembler.push(event) {
                    if forward(&tx, encoder.encode(reply_event)).await.is_err() {
                        self.disconnected(&prepared, handle.take()).await;
                        return;
                    }
                }
            }
        }
        drop(events);

        let (tail, summary) = assembler.finish();
        for reply_event in tail {
            if forward(&tx, encoder.encode(reply_event)).await.is_err() {
                self.disconnected(&prepared, handle.take()).await;
                return;
            }
        }

        let usage = self.usage_for(&prepared, &summary);
        let (reason, truncated) = self.judge(&prepared, &summary, usage, stalled);
        if let Some(kind) = truncated {
            self.log_truncation(&prepared, credential_id, kind);
            self.ledger
                .record_reply(&summary.content, &summary.tool_calls, kind);
        }
        self.record_usage(&prepared, credential_id, usage);
        let delivered = forward(&tx, encoder.encode(ReplyEvent::Finish { reason, usage }))
            .await
            .is_ok();

        let Some(handle) = handle.take() else {
            return;
        };
        if !delivered {
            self.disconnected(&prepared, Some(handle)).await;
            return;
        }
        let outcome = if stalled {
            Outcome::Transient
        } else {
            Outcome::Success
        };
        self.pool.report(handle, outcome).await;
        info!(
            event = "stream_finished",
            trace_id = %prepared.trace_id,
            credential = credential_id,
            model = %prepared.resolution.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
        );
    }

    /// The client went away: the credential did nothing wrong.
    async fn disconnected(&self, prepared: &Prepared, handle: Option<CredentialHandle>) {
        let Some(handle) = handle else {
            return;
        };
        info!(
            event = "client_disconnected",
            phase = "stream",
            trace_id = %prepared.trace_id,
            credential = handle.id(),
            model = %prepared.resolution.model,
        );
        self.pool.report(handle, Outcome::Released).await;
    }

    async fn stream_failed(
        &self,
        prepared: &Prepared,
        handle: &mut Option<CredentialHandle>,
        err: &UpstreamError,
        attempts: usize,
        encoder: &mut dyn StreamEncoder,
        tx: &mpsc::Sender<Bytes>,
    ) {
        let Some(handle) = handle.take() else {
            return;
        };
        let error = self.fail_committed(prepared, handle, err, attempts).await;
        let _ = forward(tx, encoder.encode_error(error.code(), &error.to_string())).await;
    }
}

async fn forward(tx: &mpsc::Sender<Bytes>, frames: Vec<Bytes>) -> Result<(), Disconnected> {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return Err(Disconnected);
        }
    }
    Ok(())
}
