//! The single upstream: `generateAssistantResponse` plus model listing.

mod wreq_client;

pub use wreq_client::{WreqTokenExchange, WreqUpstream};

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use kgate_protocol::kiro::{GenerateAssistantRequest, ListAvailableModelsResponse};
use kgate_provider_core::CredentialId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Raw event-stream bytes. A stall or read failure arrives as the last item.
pub type UpstreamStream = mpsc::Receiver<Result<Bytes, UpstreamError>>;

pub fn q_host(region: &str) -> String {
    format!("https://q.{region}.amazonaws.com")
}

#[derive(Debug, Clone)]
pub struct UpstreamCall {
    pub credential_id: CredentialId,
    pub region: String,
    pub access_token: String,
    pub payload: GenerateAssistantRequest,
    pub trace_id: String,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Sends the request and hands back the body once the status is known.
    async fn generate(&self, call: UpstreamCall) -> Result<UpstreamStream, UpstreamError>;

    async fn list_models(
        &self,
        region: &str,
        access_token: &str,
        profile_arn: Option<&str>,
    ) -> Result<ListAvailableModelsResponse, UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error ({kind:?}): {message}")]
    Transport { kind: TransportKind, message: String },
    #[error("upstream returned {status}: {body}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("upstream stream stalled for {0:?}")]
    Stalled(Duration),
    #[error("upstream stream is not decodable: {0}")]
    Decode(String),
    #[error("upstream exception {kind}: {message}")]
    Exception { kind: String, message: String },
}

/// What a failed call says about the credential that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Token rejected; try another credential.
    Auth,
    /// Account suspended or revoked.
    Revoked(String),
    Quota { retry_after: Option<Duration> },
    /// Monthly allowance of the account behind the credential is used up.
    Allowance(String),
    Transient,
    /// The request itself is unacceptable; no credential will do better.
    Rejected { status: u16, message: String },
}

impl UpstreamError {
    pub fn classify(&self) -> Failure {
        match self {
            UpstreamError::Status {
                status,
                retry_after,
                body,
            } => classify_status(*status, *retry_after, body),
            UpstreamError::Exception { kind, message } => classify_exception(kind, message),
            UpstreamError::Transport { .. }
            | UpstreamError::Stalled(_)
            | UpstreamError::Decode(_) => Failure::Transient,
        }
    }

    pub fn is_stall(&self) -> bool {
        matches!(
            self,
            UpstreamError::Stalled(_)
                | UpstreamError::Transport {
                    kind: TransportKind::ReadTimeout,
                    ..
                }
        )
    }
}

pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> Failure {
    let lowered = body.to_ascii_lowercase();
    match status {
        401 => Failure::Auth,
        403 if lowered.contains("suspended") || lowered.contains("account is locked") => {
            Failure::Revoked(truncate_message(body))
        }
        403 => Failure::Auth,
        429 => Failure::Quota { retry_after },
        400 if lowered.contains("monthly_request_count") || lowered.contains("quota") => {
            Failure::Allowance(truncate_message(body))
        }
        408 | 500..=599 => Failure::Transient,
        _ => Failure::Rejected {
            status,
            message: truncate_message(body),
        },
    }
}

fn classify_exception(kind: &str, message: &str) -> Failure {
    let lowered = kind.to_ascii_lowercase();
    if lowered.contains("throttling") || lowered.contains("servicequota") {
        Failure::Quota { retry_after: None }
    } else if lowered.contains("accessdenied")
        || lowered.contains("expiredtoken")
        || lowered.contains("unrecognizedclient")
    {
        Failure::Auth
    } else if lowered.contains("validation") {
        Failure::Rejected {
            status: 400,
            message: truncate_message(message),
        }
    } else {
        Failure::Transient
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

fn truncate_message(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Timeouts and egress for upstream calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    /// Bound on the wait for the first upstream frame.
    pub first_token_timeout_secs: u64,
    /// Failover attempts per request; the pool size when unset.
    pub max_attempts: Option<usize>,
    /// Base delay before retrying after a transient failure; doubles per attempt.
    pub retry_backoff_ms: u64,
    pub metadata_refresh_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 86_400,
            stream_idle_timeout_secs: 30,
            first_token_timeout_secs: 30,
            max_attempts: None,
            retry_backoff_ms: 200,
            metadata_refresh_secs: 3600,
        }
    }
}

impl UpstreamSettings {
    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_secs(self.first_token_timeout_secs.max(1))
    }

    pub fn retry_backoff(&self, attempt: usize) -> Duration {
        if self.retry_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let step = attempt.saturating_sub(1).min(6) as u32;
        let backoff = self.retry_backoff_ms.saturating_mul(1u64 << step);
        let jitter = rand::random::<u64>() % (self.retry_backoff_ms + 1);
        Duration::from_millis(backoff.saturating_add(jitter).min(2_000))
    }

    pub fn metadata_refresh(&self) -> Duration {
        Duration::from_secs(self.metadata_refresh_secs.max(60))
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn new(settings: &UpstreamSettings, proxy: Option<String>) -> Self {
        Self {
            proxy,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            request_timeout: Duration::from_secs(settings.request_timeout_secs.max(1)),
            stream_idle_timeout: Duration::from_secs(settings.stream_idle_timeout_secs.max(1)),
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self::new(&UpstreamSettings::default(), None)
    }
}
