//! Request pipeline: resolve, annotate, compress, acquire, call, translate.
//!
//! An attempt is committed once the first content event arrives. Before
//! that, every failure can move to another credential; after it, the
//! caller already has output and failures end the reply in-band.

mod events;
mod stream;

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use kgate_protocol::ReasoningMode;
use kgate_protocol::kiro::KiroEvent;
use kgate_provider_core::{
    AuthError, CredentialHandle, CredentialId, CredentialPool, ModelResolver, Outcome,
    PoolExhausted, Resolution,
};
use kgate_transform::compress::{CompressionConfig, Compressor};
use kgate_transform::conversation::{ChatRequest, ClientProtocol};
use kgate_transform::kiro_request::{KiroRequestParams, build_kiro_request};
use kgate_transform::response::{
    FinishReason, Reply, ReplyAssembler, ReplySummary, TokenUsage, build_claude_message,
    build_openai_response,
};
use kgate_transform::tokens;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::ClientIdentity;
use crate::error::PipelineError;
use crate::truncation::{
    ReplyFacts, TruncationConfig, TruncationKind, TruncationLedger, continuation_messages, detect,
    follows_tool_result, stitch,
};
use crate::upstream::{Failure, Upstream, UpstreamCall, UpstreamError, UpstreamSettings};
use crate::usage::{NoopUsageSink, SharedUsageSink, UsageRecord};

use events::{PrimeError, UpstreamEvents};

/// The HTTP surface a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// OpenAI protocol with reasoning injection and the short-stop heuristic.
    Enhanced,
    /// Plain OpenAI protocol; reasoning only for `-thinking` models.
    Standard,
    /// OpenAI protocol, reasoning never injected or shown.
    NoThink,
    /// Anthropic messages protocol.
    Anthropic,
}

impl Surface {
    pub fn as_str(self) -> &'static str {
        match self {
            Surface::Enhanced => "enhanced",
            Surface::Standard => "standard",
            Surface::NoThink => "nothink",
            Surface::Anthropic => "anthropic",
        }
    }

    fn reasoning_mode(self, requested: ReasoningMode) -> ReasoningMode {
        match self {
            Surface::NoThink => ReasoningMode::Drop,
            _ => requested,
        }
    }

    fn injection(self, request: &ChatRequest, thinking_model: bool, default_budget: u32) -> Option<u32> {
        let budget = request.thinking_budget.unwrap_or(default_budget);
        match self {
            Surface::Enhanced => Some(budget),
            Surface::Standard => thinking_model.then_some(budget),
            Surface::NoThink => None,
            Surface::Anthropic => (request.thinking_budget.is_some() || thinking_model).then_some(budget),
        }
    }

    fn short_stop_rule(self) -> bool {
        matches!(self, Surface::Enhanced | Surface::NoThink)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub surface: Surface,
    pub identity: ClientIdentity,
    pub chat: ChatRequest,
    pub trace_id: Option<String>,
}

/// A JSON body, or the frames of a streaming reply.
#[derive(Debug)]
pub enum GatewayReply {
    Complete(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub upstream: UpstreamSettings,
    pub truncation: TruncationConfig,
    pub compression: CompressionConfig,
    /// Thinking budget injected when the caller gave none.
    pub default_thinking_budget: u32,
    pub stream_buffer: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            upstream: UpstreamSettings::default(),
            truncation: TruncationConfig::default(),
            compression: CompressionConfig::default(),
            default_thinking_budget: 4000,
            stream_buffer: 32,
        }
    }
}

/// Everything decided about a request before any credential is used.
#[derive(Debug, Clone)]
struct Prepared {
    trace_id: String,
    user: Option<String>,
    sticky: Option<CredentialId>,
    request: ChatRequest,
    resolution: Resolution,
    response_model: String,
    inject_reasoning: Option<u32>,
    mode: ReasoningMode,
    short_stop_rule: bool,
    after_tool_result: bool,
    prompt_estimate: u32,
    max_input_tokens: Option<u64>,
}

/// A primed attempt: the credential that made it and its pending events.
struct Opened {
    handle: CredentialHandle,
    events: UpstreamEvents,
    attempts: usize,
}

/// The last failure seen while failing over, for the final error.
#[derive(Debug, Clone)]
enum LastFailure {
    Auth,
    Quota {
        message: String,
        retry_after: Option<std::time::Duration>,
    },
    Allowance(String),
    Transient(String),
}

struct Collected {
    summary: ReplySummary,
    stalled: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: Arc<CredentialPool>,
    resolver: Arc<ModelResolver>,
    upstream: Arc<dyn Upstream>,
    ledger: Arc<TruncationLedger>,
    usage: SharedUsageSink,
    compressor: Arc<Compressor>,
    settings: Arc<OrchestratorSettings>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<CredentialPool>,
        resolver: Arc<ModelResolver>,
        upstream: Arc<dyn Upstream>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            resolver,
            upstream,
            ledger: Arc::new(TruncationLedger::new(settings.truncation.ledger_capacity)),
            usage: Arc::new(NoopUsageSink),
            compressor: Arc::new(Compressor::new(settings.compression.clone())),
            settings: Arc::new(settings),
        }
    }

    pub fn with_usage_sink(mut self, usage: SharedUsageSink) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<TruncationLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn resolver(&self) -> &Arc<ModelResolver> {
        &self.resolver
    }

    pub fn ledger(&self) -> &Arc<TruncationLedger> {
        &self.ledger
    }

    pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayReply, PipelineError> {
        let prepared = self.prepare(request);
        info!(
            event = "request_received",
            trace_id = %prepared.trace_id,
            requested = %prepared.resolution.requested,
            model = %prepared.resolution.model,
            rule = prepared.resolution.rule.as_str(),
            stream = prepared.request.stream,
            messages = prepared.request.messages.len(),
            reasoning = prepared.inject_reasoning.is_some(),
        );
        let opened = self.open(&prepared, prepared.sticky).await?;
        if prepared.request.stream {
            Ok(GatewayReply::Stream(self.spawn_stream(prepared, opened)))
        } else {
            self.complete(prepared, opened).await.map(GatewayReply::Complete)
        }
    }

    fn prepare(&self, request: GatewayRequest) -> Prepared {
        let GatewayRequest {
            surface,
            identity,
            chat: mut request,
            trace_id,
        } = request;
        let trace_id = trace_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let resolution = self.resolver.resolve(&request.model);
        let max_input_tokens = self.resolver.max_input_tokens(&resolution.model);

        let (messages, _) = self.ledger.annotate(std::mem::take(&mut request.messages));
        request.messages = messages;

        if request.options.context_compression {
            let window = max_input_tokens.and_then(|limit| usize::try_from(limit).ok());
            let compressed = self
                .compressor
                .compress(&request.messages, &request.tools, window);
            let report = &compressed.report;
            if report.overflow() {
                warn!(
                    event = "compression_overflow",
                    phase = "compress",
                    trace_id = %trace_id,
                    model = %resolution.model,
                    window = report.context_window,
                    tokens = report.final_tokens,
                );
            } else if report.final_tokens < report.original_tokens {
                info!(
                    event = "context_compressed",
                    trace_id = %trace_id,
                    subagent = report.subagent,
                    original_tokens = report.original_tokens,
                    final_tokens = report.final_tokens,
                    original_messages = report.original_messages,
                    final_messages = report.final_messages,
                );
            }
            request.messages = compressed.messages;
        }

        let inject_reasoning = surface.injection(
            &request,
            resolution.thinking,
            self.settings.default_thinking_budget,
        );
        let mode = surface.reasoning_mode(request.options.reasoning_mode);
        let after_tool_result = follows_tool_result(&request.messages);
        let prompt_estimate = tokens::count_request(&request);
        Prepared {
            trace_id,
            user: identity.user,
            sticky: identity.sticky,
            response_model: resolution.resolved_id(),
            resolution,
            inject_reasoning,
            mode,
            short_stop_rule: surface.short_stop_rule(),
            after_tool_result,
            prompt_estimate,
            max_input_tokens,
            request,
        }
    }

    /// Acquires credentials until one primes a stream, within the attempt budget.
    async fn open(
        &self,
        prepared: &Prepared,
        mut sticky: Option<CredentialId>,
    ) -> Result<Opened, PipelineError> {
        let budget = match self.settings.upstream.max_attempts {
            Some(max) => max,
            None => self.pool.len().await,
        }
        .max(1);
        let first_token = self.settings.upstream.first_token_timeout();
        let idle = std::time::Duration::from_secs(
            self.settings.upstream.stream_idle_timeout_secs.max(1),
        );
        let mut attempts = 0usize;
        let mut empty_retry_used = false;
        let mut last: Option<LastFailure> = None;

        loop {
            let mut handle = match self.pool.acquire(sticky.take()).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(
                        event = "failover_exhausted",
                        phase = "acquire",
                        trace_id = %prepared.trace_id,
                        model = %prepared.resolution.model,
                        attempts,
                    );
                    return Err(final_error(last, attempts, err));
                }
            };
            // The single stall retry does not eat into the failover budget.
            if attempts >= budget + usize::from(empty_retry_used) {
                let total = self.pool.len().await;
                self.pool.report(handle, Outcome::Released).await;
                warn!(
                    event = "failover_exhausted",
                    phase = "upstream_call",
                    trace_id = %prepared.trace_id,
                    model = %prepared.resolution.model,
                    attempts,
                );
                return Err(final_error(last, attempts, PoolExhausted { total }));
            }
            attempts += 1;
            let credential_id = handle.id();

            let session = match handle.token().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(
                        event = "credential_token_failed",
                        phase = "auth_refresh",
                        trace_id = %prepared.trace_id,
                        credential = credential_id,
                        model = %prepared.resolution.model,
                        error = %err,
                    );
                    let outcome = match &err {
                        AuthError::Disabled { reason, .. } => Outcome::Revoked(reason.clone()),
                        AuthError::RefreshFailed { .. } => Outcome::Transient,
                    };
                    self.pool.report(handle, outcome).await;
                    last = Some(if err.is_terminal() {
                        LastFailure::Auth
                    } else {
                        LastFailure::Transient(err.to_string())
                    });
                    continue;
                }
            };

            let profile_arn = session
                .profile_arn
                .clone()
                .or_else(|| handle.manager().credential().profile_arn.clone());
            let payload = build_kiro_request(
                &prepared.request,
                &KiroRequestParams {
                    model_id: prepared.resolution.model.clone(),
                    conversation_id: uuid::Uuid::new_v4().to_string(),
                    profile_arn,
                    inject_reasoning: prepared.inject_reasoning,
                },
            );
            debug!(
                event = "upstream_request",
                trace_id = %prepared.trace_id,
                credential = credential_id,
                model = %prepared.resolution.model,
                attempt = attempts,
                stream = prepared.request.stream,
            );
            let call = UpstreamCall {
                credential_id,
                region: handle.region(),
                access_token: session.access_token.clone(),
                payload,
                trace_id: prepared.trace_id.clone(),
            };

            let primed = match self.upstream.generate(call).await {
                Ok(rx) => UpstreamEvents::prime(rx, first_token, idle).await,
                Err(err) => Err(PrimeError::Upstream(err)),
            };
            let err = match primed {
                Ok(events) => {
                    return Ok(Opened {
                        handle,
                        events,
                        attempts,
                    });
                }
                Err(PrimeError::Upstream(err)) => err,
                Err(failure) => {
                    let reason = match failure {
                        PrimeError::Empty => "empty_stream",
                        _ => "first_token_timeout",
                    };
                    warn!(
                        event = "upstream_stalled",
                        phase = "stream",
                        trace_id = %prepared.trace_id,
                        credential = credential_id,
                        model = %prepared.resolution.model,
                        reason,
                        retry = !empty_retry_used,
                    );
                    self.pool.report(handle, Outcome::Transient).await;
                    if empty_retry_used {
                        return Err(PipelineError::UpstreamTransient {
                            attempts,
                            message: reason.to_string(),
                        });
                    }
                    empty_retry_used = true;
                    last = Some(LastFailure::Transient(reason.to_string()));
                    continue;
                }
            };

            let failure = err.classify();
            warn!(
                event = "upstream_failed",
                phase = "upstream_call",
                trace_id = %prepared.trace_id,
                credential = credential_id,
                model = %prepared.resolution.model,
                attempt = attempts,
                error = %err,
            );
            match failure {
                Failure::Auth => {
                    self.pool.report(handle, Outcome::AuthFailure).await;
                    last = Some(LastFailure::Auth);
                }
                Failure::Revoked(reason) => {
                    self.pool.report(handle, Outcome::Revoked(reason)).await;
                    last = Some(LastFailure::Auth);
                }
                Failure::Quota { retry_after } => {
                    self.pool
                        .report(handle, Outcome::QuotaExceeded { retry_after })
                        .await;
                    last = Some(LastFailure::Quota {
                        message: err.to_string(),
                        retry_after,
                    });
                }
                Failure::Allowance(message) => {
                    self.pool
                        .report(handle, Outcome::QuotaExceeded { retry_after: None })
                        .await;
                    last = Some(LastFailure::Allowance(message));
                }
                Failure::Transient => {
                    self.pool.report(handle, Outcome::Transient).await;
                    last = Some(LastFailure::Transient(err.to_string()));
                    let delay = self.settings.upstream.retry_backoff(attempts);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Failure::Rejected { status, message } => {
                    self.pool.report(handle, Outcome::Released).await;
                    return Err(PipelineError::UpstreamRejected { status, message });
                }
            }
        }
    }

    /// Reads a primed attempt to the end without forwarding anything.
    async fn collect(&self, prepared: &Prepared, opened: Opened) -> Result<Collected, PipelineError> {
        let Opened {
            handle,
            mut events,
            attempts,
        } = opened;
        let credential_id = handle.id();
        let mut assembler = ReplyAssembler::new(prepared.mode);
        let mut stalled = false;
        while let Some(next) = events.next().await {
            match next {
                Ok(batch) => {
                    for event in batch {
                        if let KiroEvent::Exception { kind, message } = event {
                            let err = UpstreamError::Exception { kind, message };
                            return Err(self.fail_committed(prepared, handle, &err, attempts).await);
                        }
                        assembler.push(event);
                    }
                }
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
                }
                Err(err) => return Err(self.fail_committed(prepared, handle, &err, attempts).await),
            }
        }
        drop(events);
        let (_, summary) = assembler.finish();
        let outcome = if stalled {
            Outcome::Transient
        } else {
            Outcome::Success
        };
        self.pool.report(handle, outcome).await;
        Ok(Collected { summary, stalled })
    }

    /// Reports a failure after output started and builds the caller-facing error.
    async fn fail_committed(
        &self,
        prepared: &Prepared,
        handle: CredentialHandle,
        err: &UpstreamError,
        attempts: usize,
    ) -> PipelineError {
        warn!(
            event = "upstream_failed",
            phase = "stream",
            trace_id = %prepared.trace_id,
            credential = handle.id(),
            model = %prepared.resolution.model,
            error = %err,
        );
        let (outcome, error) = committed_failure(err, attempts);
        self.pool.report(handle, outcome).await;
        error
    }

    async fn complete(&self, prepared: Prepared, opened: Opened) -> Result<Bytes, PipelineError> {
        let credential_id = opened.handle.id();
        let first = self.collect(&prepared, opened).await?;
        let mut summary = first.summary;
        let mut usage = self.usage_for(&prepared, &summary);
        let mut judged = self.judge(&prepared, &summary, usage, first.stalled);

        if let Some(kind) = judged.1 {
            self.log_truncation(&prepared, credential_id, kind);
            let continued = if self.settings.truncation.continuation
                && kind != TruncationKind::UnbalancedToolArguments
            {
                self.continue_reply(&prepared, &summary).await
            } else {
                None
            };
            match continued {
                Some(continuation) => {
                    summary = merge_continuation(summary, continuation.summary);
                    usage.completion_tokens = tokens::count_text(&summary.generated_text());
                    let rejudge = Prepared {
                        after_tool_result: false,
                        ..prepared.clone()
                    };
                    judged = self.judge(&rejudge, &summary, usage, continuation.stalled);
                    if let Some(kind) = judged.1 {
                        self.ledger
                            .record_reply(&summary.content, &summary.tool_calls, kind);
                    }
                }
                None => {
                    self.ledger
                        .record_reply(&summary.content, &summary.tool_calls, kind);
                }
            }
        }

        self.record_usage(&prepared, credential_id, usage);
        let reply = Reply {
            content: summary.content,
            reasoning: summary.reasoning,
            tool_calls: summary.tool_calls,
            finish: judged.0,
            usage,
        };
        self.render(&prepared, reply)
    }

    /// One resubmission of a truncated non-stream reply. `None` leaves the original as is.
    async fn continue_reply(&self, prepared: &Prepared, partial: &ReplySummary) -> Option<Collected> {
        let mut request = prepared.request.clone();
        request.messages = continuation_messages(&request.messages, &partial.content);
        let continuation = Prepared {
            request,
            after_tool_result: false,
            ..prepared.clone()
        };
        let result = match self.open(&continuation, None).await {
            Ok(opened) => self.collect(&continuation, opened).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(collected) => {
                info!(
                    event = "truncation_continued",
                    phase = "truncation",
                    trace_id = %prepared.trace_id,
                    model = %prepared.resolution.model,
                    chars = collected.summary.content.len(),
                );
                Some(collected)
            }
            Err(err) => {
                warn!(
                    event = "truncation_unrecoverable",
                    phase = "truncation",
                    trace_id = %prepared.trace_id,
                    model = %prepared.resolution.model,
                    error = %err,
                );
                None
            }
        }
    }

    fn usage_for(&self, prepared: &Prepared, summary: &ReplySummary) -> TokenUsage {
        let prompt_tokens = summary
            .context_usage
            .zip(prepared.max_input_tokens)
            .and_then(|(percentage, max)| {
                tokens::from_context_usage(percentage, u32::try_from(max).unwrap_or(u32::MAX))
            })
            .unwrap_or(prepared.prompt_estimate);
        TokenUsage {
            prompt_tokens,
            completion_tokens: tokens::count_text(&summary.generated_text()),
        }
    }

    /// Finish reason for a finished reply, rewritten to `Length` when it looks cut off.
    fn judge(
        &self,
        prepared: &Prepared,
        summary: &ReplySummary,
        usage: TokenUsage,
        stalled: bool,
    ) -> (FinishReason, Option<TruncationKind>) {
        let natural = if summary.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        let facts = ReplyFacts {
            finish: natural,
            completion_signal: summary.completion_signal,
            produced_text: !summary.content.is_empty() || !summary.reasoning.is_empty(),
            tool_calls: &summary.tool_calls,
            request_has_tools: prepared.request.has_tools(),
            after_tool_result: prepared.after_tool_result,
            completion_tokens: usage.completion_tokens,
            prompt_tokens: usage.prompt_tokens,
            text: &summary.content,
            short_stop_rule: prepared.short_stop_rule,
        };
        match detect(&facts, &self.settings.truncation) {
            Some(kind) => (FinishReason::Length, Some(kind)),
            None if stalled => (
                FinishReason::Length,
                Some(TruncationKind::MissingCompletionSignal),
            ),
            None => (natural, None),
        }
    }

    fn log_truncation(&self, prepared: &Prepared, credential_id: CredentialId, kind: TruncationKind) {
        warn!(
            event = "truncation_detected",
            phase = "truncation",
            trace_id = %prepared.trace_id,
            credential = credential_id,
            model = %prepared.resolution.model,
            kind = kind.as_str(),
        );
    }

    fn record_usage(&self, prepared: &Prepared, credential_id: CredentialId, usage: TokenUsage) {
        self.usage.record(UsageRecord {
            user: prepared
                .user
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            model: prepared.response_model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            credential_id,
            at: SystemTime::now(),
        });
    }

    fn render(&self, prepared: &Prepared, reply: Reply) -> Result<Bytes, PipelineError> {
        let body = match prepared.request.protocol {
            ClientProtocol::OpenAIChat => serde_json::to_vec(&build_openai_response(
                &openai_id(),
                &prepared.response_model,
                unix_now(),
                reply,
                prepared.mode,
            )),
            ClientProtocol::AnthropicMessages => serde_json::to_vec(&build_claude_message(
                &claude_id(),
                &prepared.response_model,
                reply,
                prepared.mode,
            )),
        };
        body.map(Bytes::from)
            .map_err(|err| PipelineError::Internal(err.to_string()))
    }
}

fn final_error(last: Option<LastFailure>, attempts: usize, exhausted: PoolExhausted) -> PipelineError {
    match last {
        Some(LastFailure::Quota {
            message,
            retry_after,
        }) => PipelineError::RateLimited {
            message,
            retry_after,
        },
        Some(LastFailure::Allowance(message)) => PipelineError::AllowanceExhausted(message),
        Some(LastFailure::Transient(message)) => {
            PipelineError::UpstreamTransient { attempts, message }
        }
        Some(LastFailure::Auth) | None => PipelineError::PoolExhausted(exhausted),
    }
}

fn committed_failure(err: &UpstreamError, attempts: usize) -> (Outcome, PipelineError) {
    let transient = || PipelineError::UpstreamTransient {
        attempts,
        message: err.to_string(),
    };
    match err.classify() {
        Failure::Auth => (Outcome::AuthFailure, transient()),
        Failure::Revoked(reason) => (Outcome::Revoked(reason), transient()),
        Failure::Quota { retry_after } => (
            Outcome::QuotaExceeded { retry_after },
            PipelineError::RateLimited {
                message: err.to_string(),
                retry_after,
            },
        ),
        Failure::Allowance(message) => (
            Outcome::QuotaExceeded { retry_after: None },
            PipelineError::AllowanceExhausted(message),
        ),
        Failure::Transient => (Outcome::Transient, transient()),
        Failure::Rejected { status, message } => (
            Outcome::Released,
            PipelineError::UpstreamRejected { status, message },
        ),
    }
}

fn merge_continuation(mut original: ReplySummary, continuation: ReplySummary) -> ReplySummary {
    original.content = stitch(&original.content, &continuation.content);
    original.reasoning.push_str(&continuation.reasoning);
    original.tool_calls.extend(continuation.tool_calls);
    original.completion_signal = continuation.completion_signal;
    original.context_usage = continuation.context_usage.or(original.context_usage);
    original.content_events += continuation.content_events;
    original
}

fn openai_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn claude_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_transform::conversation::{Message, Role};

    fn chat(model: &str) -> ChatRequest {
        ChatRequest {
            protocol: ClientProtocol::OpenAIChat,
            model: model.to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            tools: Vec::new(),
            stream: false,
            max_tokens: None,
            temperature: None,
            top_p: None,
            thinking_budget: None,
            options: Default::default(),
        }
    }

    #[test]
    fn surfaces_decide_injection() {
        let plain = chat("claude-sonnet-4.5");
        assert_eq!(Surface::Enhanced.injection(&plain, false, 4000), Some(4000));
        assert_eq!(Surface::Standard.injection(&plain, false, 4000), None);
        assert_eq!(Surface::Standard.injection(&plain, true, 4000), Some(4000));
        assert_eq!(Surface::NoThink.injection(&plain, true, 4000), None);
        assert_eq!(Surface::Anthropic.injection(&plain, false, 4000), None);

        let mut budgeted = plain.clone();
        budgeted.thinking_budget = Some(1024);
        assert_eq!(Surface::Anthropic.injection(&budgeted, false, 4000), Some(1024));
        assert_eq!(Surface::Enhanced.injection(&budgeted, false, 4000), Some(1024));

        assert_eq!(
            Surface::NoThink.reasoning_mode(ReasoningMode::Content),
            ReasoningMode::Drop
        );
        assert_eq!(
            Surface::Enhanced.reasoning_mode(ReasoningMode::Content),
            ReasoningMode::Content
        );
        assert!(Surface::Enhanced.short_stop_rule());
        assert!(!Surface::Standard.short_stop_rule());
        assert!(!Surface::Anthropic.short_stop_rule());
    }

    #[test]
    fn final_error_prefers_the_last_failure_kind() {
        let exhausted = PoolExhausted { total: 3 };
        assert!(matches!(
            final_error(None, 0, exhausted),
            PipelineError::PoolExhausted(_)
        ));
        assert!(matches!(
            final_error(Some(LastFailure::Auth), 3, exhausted),
            PipelineError::PoolExhausted(_)
        ));
        assert!(matches!(
            final_error(Some(LastFailure::Transient("503".to_string())), 2, exhausted),
            PipelineError::UpstreamTransient { attempts: 2, .. }
        ));
        let limited = final_error(
            Some(LastFailure::Quota {
                message: "slow down".to_string(),
                retry_after: Some(std::time::Duration::from_secs(9)),
            }),
            1,
            exhausted,
        );
        assert_eq!(limited.status().as_u16(), 429);
        assert_eq!(limited.retry_after(), Some(std::time::Duration::from_secs(9)));
        assert_eq!(
            final_error(Some(LastFailure::Allowance("monthly".to_string())), 1, exhausted)
                .status()
                .as_u16(),
            403
        );
    }

    #[test]
    fn continuation_merge_stitches_overlap() {
        let original = ReplySummary {
            content: "The answer begins here and".to_string(),
            ..Default::default()
        };
        let continuation = ReplySummary {
            content: "begins here and continues.".to_string(),
            completion_signal: true,
            ..Default::default()
        };
        let merged = merge_continuation(original, continuation);
        assert_eq!(merged.content, "The answer begins here and continues.");
        assert!(merged.completion_signal);
    }
}
