#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kgate_core::{
    Orchestrator, OrchestratorSettings, Upstream, UpstreamCall, UpstreamError, UpstreamSettings,
    UpstreamStream,
};
use kgate_protocol::kiro::event_stream::encode_frame;
use kgate_protocol::kiro::{ListAvailableModelsResponse, ModelInfo, TokenLimits};
use kgate_provider_core::{
    AuthManager, AuthMethod, Credential, CredentialId, CredentialPool, CredentialStatus, EventHub,
    ExchangeError, ModelCatalog, ModelMappings, ModelResolver, PoolPolicy, RefreshPolicy,
    TokenExchange, TokenGrant,
};
use tokio::sync::mpsc;

pub const MODEL: &str = "claude-sonnet-4.5";

/// One scripted upstream answer.
pub enum Scripted {
    /// Frames, then the stream closes.
    Frames(Vec<Bytes>),
    /// Frames, then the stream stays open without sending anything else.
    Hang(Vec<Bytes>),
    Status(u16, &'static str),
}

/// Upstream double: replays scripted answers in call order, then answers "ok".
#[derive(Default)]
pub struct FakeUpstream {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<UpstreamCall>>,
    held: Mutex<Vec<mpsc::Sender<Result<Bytes, UpstreamError>>>>,
}

impl FakeUpstream {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<UpstreamCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn credentials_used(&self) -> Vec<CredentialId> {
        self.calls().iter().map(|call| call.credential_id).collect()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn generate(&self, call: UpstreamCall) -> Result<UpstreamStream, UpstreamError> {
        self.calls.lock().unwrap().push(call);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::Frames(answer("ok")));
        let (tx, rx) = mpsc::channel(64);
        match next {
            Scripted::Status(status, body) => {
                return Err(UpstreamError::Status {
                    status,
                    retry_after: None,
                    body: body.to_string(),
                });
            }
            Scripted::Frames(frames) => {
                for frame in frames {
                    tx.try_send(Ok(frame)).unwrap();
                }
            }
            Scripted::Hang(frames) => {
                for frame in frames {
                    tx.try_send(Ok(frame)).unwrap();
                }
                self.held.lock().unwrap().push(tx);
            }
        }
        Ok(rx)
    }

    async fn list_models(
        &self,
        _region: &str,
        _access_token: &str,
        _profile_arn: Option<&str>,
    ) -> Result<ListAvailableModelsResponse, UpstreamError> {
        Ok(ListAvailableModelsResponse {
            models: vec![model_info(MODEL, 200_000)],
            next_token: None,
        })
    }
}

/// Token service double that always grants.
pub struct GrantAll;

#[async_trait]
impl TokenExchange for GrantAll {
    async fn exchange(
        &self,
        method: &AuthMethod,
        _region: &str,
    ) -> Result<TokenGrant, ExchangeError> {
        Ok(TokenGrant {
            access_token: format!("access-{}", method.refresh_token()),
            refresh_token: None,
            expires_in: 3600,
            profile_arn: None,
        })
    }
}

pub fn text(content: &str) -> Bytes {
    event(
        "assistantResponseEvent",
        &serde_json::json!({ "content": content }).to_string(),
    )
}

pub fn context_usage(percentage: f64) -> Bytes {
    event(
        "contextUsageEvent",
        &serde_json::json!({ "contextUsagePercentage": percentage }).to_string(),
    )
}

pub fn stop() -> Bytes {
    event("messageStopEvent", "{}")
}

pub fn exception(kind: &str, message: &str) -> Bytes {
    encode_frame(
        &[(":message-type", "exception"), (":exception-type", kind)],
        serde_json::json!({ "message": message }).to_string().as_bytes(),
    )
}

fn event(event_type: &str, payload: &str) -> Bytes {
    encode_frame(
        &[(":event-type", event_type), (":message-type", "event")],
        payload.as_bytes(),
    )
}

/// A complete, normally finished reply.
pub fn answer(content: &str) -> Vec<Bytes> {
    vec![text(content), context_usage(1.0), stop()]
}

pub fn model_info(model_id: &str, max_input_tokens: u64) -> ModelInfo {
    ModelInfo {
        model_id: model_id.to_string(),
        model_name: None,
        description: None,
        token_limits: Some(TokenLimits {
            max_input_tokens: Some(max_input_tokens),
            max_output_tokens: None,
        }),
    }
}

pub fn credential(id: CredentialId) -> Credential {
    Credential {
        id,
        auth: AuthMethod::RefreshToken {
            refresh_token: format!("refresh-{id}"),
        },
        region: None,
        profile_arn: None,
        status: CredentialStatus::Active,
        access_token: None,
        expires_at: None,
    }
}

pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        upstream: UpstreamSettings {
            first_token_timeout_secs: 1,
            stream_idle_timeout_secs: 1,
            retry_backoff_ms: 0,
            ..UpstreamSettings::default()
        },
        ..OrchestratorSettings::default()
    }
}

pub async fn orchestrator_with(
    ids: &[CredentialId],
    upstream: Arc<FakeUpstream>,
    settings: OrchestratorSettings,
) -> Orchestrator {
    let events = EventHub::new(64);
    let pool = Arc::new(CredentialPool::new(events.clone(), PoolPolicy::default()));
    let exchange: Arc<dyn TokenExchange> = Arc::new(GrantAll);
    for id in ids {
        let manager = AuthManager::new(
            credential(*id),
            exchange.clone(),
            RefreshPolicy {
                attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                safety_margin: Duration::from_secs(60),
            },
            "us-east-1",
        )
        .with_events(events.clone());
        pool.insert(Arc::new(manager)).await;
    }
    let resolver = Arc::new(ModelResolver::new(ModelMappings::builtin()));
    resolver.replace_catalog(ModelCatalog::new(vec![model_info(MODEL, 200_000)]));
    Orchestrator::new(pool, resolver, upstream, settings)
}

pub async fn orchestrator(ids: &[CredentialId], upstream: Arc<FakeUpstream>) -> Orchestrator {
    orchestrator_with(ids, upstream, test_settings()).await
}
