use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use kgate_core::{
    ClientAuthenticator, ClientKeyConfig, KeySnapshot, MemoryClientKeys, OpenAccess, Orchestrator,
    OrchestratorSettings, Upstream, UpstreamCall, UpstreamError, UpstreamStream,
};
use kgate_protocol::kiro::event_stream::encode_frame;
use kgate_protocol::kiro::{ListAvailableModelsResponse, ModelInfo, TokenLimits};
use kgate_provider_core::{
    AuthManager, AuthMethod, Credential, CredentialPool, CredentialStatus, EventHub,
    ExchangeError, ModelCatalog, ModelMappings, ModelResolver, PoolPolicy, RefreshPolicy,
    TokenExchange, TokenGrant,
};
use kgate_router::{ProxyState, proxy_router};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

const MODEL: &str = "claude-sonnet-4.5";

struct EchoUpstream;

fn frame(event_type: &str, payload: Value) -> Bytes {
    encode_frame(
        &[(":event-type", event_type), (":message-type", "event")],
        payload.to_string().as_bytes(),
    )
}

#[async_trait]
impl Upstream for EchoUpstream {
    async fn generate(&self, _call: UpstreamCall) -> Result<UpstreamStream, UpstreamError> {
        let (tx, rx) = mpsc::channel(8);
        for bytes in [
            frame("assistantResponseEvent", serde_json::json!({ "content": "pong" })),
            frame(
                "contextUsageEvent",
                serde_json::json!({ "contextUsagePercentage": 1.0 }),
            ),
            frame("messageStopEvent", serde_json::json!({})),
        ] {
            tx.try_send(Ok(bytes)).unwrap();
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
            models: vec![model_info()],
            next_token: None,
        })
    }
}

struct GrantAll;

#[async_trait]
impl TokenExchange for GrantAll {
    async fn exchange(&self, _method: &AuthMethod, _region: &str) -> Result<TokenGrant, ExchangeError> {
        Ok(TokenGrant {
            access_token: "access".to_string(),
            refresh_token: None,
            expires_in: 3600,
            profile_arn: None,
        })
    }
}

fn model_info() -> ModelInfo {
    ModelInfo {
        model_id: MODEL.to_string(),
        model_name: None,
        description: None,
        token_limits: Some(TokenLimits {
            max_input_tokens: Some(200_000),
            max_output_tokens: None,
        }),
    }
}

async fn orchestrator() -> Orchestrator {
    let events = EventHub::new(16);
    let pool = Arc::new(CredentialPool::new(events.clone(), PoolPolicy::default()));
    let manager = AuthManager::new(
        Credential {
            id: 1,
            auth: AuthMethod::RefreshToken {
                refresh_token: "refresh-1".to_string(),
            },
            region: None,
            profile_arn: None,
            status: CredentialStatus::Active,
            access_token: None,
            expires_at: None,
        },
        Arc::new(GrantAll),
        RefreshPolicy {
            attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            safety_margin: Duration::from_secs(60),
        },
        "us-east-1",
    );
    pool.insert(Arc::new(manager)).await;
    let resolver = Arc::new(ModelResolver::new(ModelMappings::builtin()));
    resolver.replace_catalog(ModelCatalog::new(vec![model_info()]));
    Orchestrator::new(
        pool,
        resolver,
        Arc::new(EchoUpstream),
        OrchestratorSettings::default(),
    )
}

async fn app(authenticator: Arc<dyn ClientAuthenticator>) -> Router {
    proxy_router(ProxyState {
        orchestrator: orchestrator().await,
        authenticator,
    })
}

fn keyed() -> Arc<dyn ClientAuthenticator> {
    Arc::new(MemoryClientKeys::new(KeySnapshot::from_config(&[
        ClientKeyConfig {
            key: "sk-test".to_string(),
            user: Some("tester".to_string()),
            enabled: true,
            sticky_credential: None,
        },
    ])))
}

fn post(path: &str, body: &str) -> Request<Body> {
    Request::post(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer sk-test")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_key_is_rejected_in_the_callers_protocol() {
    let app = app(keyed()).await;

    let resp = app
        .clone()
        .oneshot(
            Request::post("/v1/chat/completions")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "invalid_api_key");

    let resp = app
        .oneshot(Request::post("/v1/messages").body(Body::from("{}")).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert_eq!(body["type"], "error");
}

#[tokio::test]
async fn health_skips_client_auth() {
    let resp = app(keyed())
        .await
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let resp = app(keyed())
        .await
        .oneshot(post("/v1/chat/completions", "{not json"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn empty_messages_are_rejected_before_any_upstream_call() {
    let resp = app(keyed())
        .await
        .oneshot(post(
            "/standard/v1/chat/completions",
            r#"{"model":"claude-sonnet-4.5","messages":[]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn openai_completion_round_trip() {
    let resp = app(keyed())
        .await
        .oneshot(post(
            "/standard/v1/chat/completions",
            r#"{"model":"claude-sonnet-4.5","messages":[{"role":"user","content":"ping"}]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn anthropic_messages_round_trip() {
    let resp = app(Arc::new(OpenAccess))
        .await
        .oneshot(post(
            "/v1/messages",
            r#"{"model":"claude-sonnet-4.5","max_tokens":256,"messages":[{"role":"user","content":"ping"}]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["stop_reason"], "end_turn");
}

#[tokio::test]
async fn streams_are_served_as_server_sent_events() {
    let resp = app(keyed())
        .await
        .oneshot(post(
            "/nothink/v1/chat/completions",
            r#"{"model":"claude-sonnet-4.5","stream":true,"messages":[{"role":"user","content":"ping"}]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(resp.headers()["x-accel-buffering"], "no");

    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("pong"));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn models_are_listed_in_either_protocol() {
    let app = app(keyed()).await;

    let resp = app
        .clone()
        .oneshot(
            Request::get("/v1/models")
                .header("x-api-key", "sk-test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|model| model["id"].as_str())
        .collect();
    assert!(ids.contains(&MODEL));
    assert!(ids.contains(&"claude-sonnet-4.5-thinking"));
    assert!(ids.contains(&"kiro-sonnet-4-5"));

    let resp = app
        .oneshot(
            Request::get("/v1/models/claude-sonnet-4.5")
                .header("x-api-key", "sk-test")
                .header("anthropic-version", "2023-06-01")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["type"], "model");
    assert_eq!(body["id"], MODEL);
}
