use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Extension, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use kgate_core::{
    ClientAuthenticator, ClientIdentity, GatewayReply, GatewayRequest, Orchestrator, PipelineError,
    Surface,
};
use kgate_protocol::claude::messages::CreateMessageRequestBody;
use kgate_protocol::openai::chat::CreateChatCompletionRequestBody;
use kgate_transform::ValidationError;
use kgate_transform::conversation::ClientProtocol;
use kgate_transform::request::{from_claude_messages, from_openai_chat};

#[derive(Clone)]
pub struct ProxyState {
    pub orchestrator: Orchestrator,
    pub authenticator: Arc<dyn ClientAuthenticator>,
}

#[derive(Debug, Clone)]
pub struct RequestTraceId(pub String);

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
/// Image-bearing conversations easily exceed axum's 2 MiB default.
const MAX_REQUEST_BODY_BYTES: usize = 50 * 1024 * 1024;
const MODEL_OWNER: &str = "kiro";

pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_enhanced))
        .route(
            "/standard/v1/chat/completions",
            post(chat_completions_standard),
        )
        .route(
            "/nothink/v1/chat/completions",
            post(chat_completions_nothink),
        )
        .route("/v1/messages", post(claude_messages))
        // Shared OpenAI/Claude models endpoints (disambiguate by `anthropic-version` header).
        .route("/v1/models", get(models_list))
        .route("/v1/models/{*model}", get(models_get))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .route("/health", get(health))
        .with_state(state)
}

async fn proxy_auth(
    State(state): State<ProxyState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let trace_id = uuid::Uuid::now_v7().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let protocol = protocol_for_path(&path, req.headers());

    let identity = match state.authenticator.authenticate(req.headers()) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(
                event = "client_rejected",
                trace_id = %trace_id,
                path = %path,
                code = err.code(),
            );
            return error_response(&err, protocol);
        }
    };

    // Client keys never travel further than this layer.
    req.headers_mut().remove(header::AUTHORIZATION);
    req.headers_mut().remove("x-api-key");
    req.extensions_mut().insert(RequestTraceId(trace_id.clone()));
    req.extensions_mut().insert(identity);

    let resp = next.run(req).await;
    info!(
        event = "downstream_response",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
    );
    resp
}

async fn health() -> Response {
    json_response(StatusCode::OK, Bytes::from_static(b"{\"status\":\"ok\"}"))
}

async fn chat_completions_enhanced(
    State(state): State<ProxyState>,
    Extension(identity): Extension<ClientIdentity>,
    Extension(trace_id): Extension<RequestTraceId>,
    body: Bytes,
) -> Response {
    openai_chat(state, Surface::Enhanced, identity, trace_id, body).await
}

async fn chat_completions_standard(
    State(state): State<ProxyState>,
    Extension(identity): Extension<ClientIdentity>,
    Extension(trace_id): Extension<RequestTraceId>,
    body: Bytes,
) -> Response {
    openai_chat(state, Surface::Standard, identity, trace_id, body).await
}

async fn chat_completions_nothink(
    State(state): State<ProxyState>,
    Extension(identity): Extension<ClientIdentity>,
    Extension(trace_id): Extension<RequestTraceId>,
    body: Bytes,
) -> Response {
    openai_chat(state, Surface::NoThink, identity, trace_id, body).await
}

async fn openai_chat(
    state: ProxyState,
    surface: Surface,
    identity: ClientIdentity,
    trace_id: RequestTraceId,
    body: Bytes,
) -> Response {
    let protocol = ClientProtocol::OpenAIChat;
    let chat = match decode_json::<CreateChatCompletionRequestBody>(&body)
        .and_then(|body| from_openai_chat(body).map_err(PipelineError::from))
    {
        Ok(chat) => chat,
        Err(err) => return error_response(&err, protocol),
    };
    dispatch(&state, surface, identity, trace_id, chat, protocol).await
}

async fn claude_messages(
    State(state): State<ProxyState>,
    Extension(identity): Extension<ClientIdentity>,
    Extension(trace_id): Extension<RequestTraceId>,
    body: Bytes,
) -> Response {
    let protocol = ClientProtocol::AnthropicMessages;
    let chat = match decode_json::<CreateMessageRequestBody>(&body)
        .and_then(|body| from_claude_messages(body).map_err(PipelineError::from))
    {
        Ok(chat) => chat,
        Err(err) => return error_response(&err, protocol),
    };
    dispatch(&state, Surface::Anthropic, identity, trace_id, chat, protocol).await
}

async fn dispatch(
    state: &ProxyState,
    surface: Surface,
    identity: ClientIdentity,
    trace_id: RequestTraceId,
    chat: kgate_transform::ChatRequest,
    protocol: ClientProtocol,
) -> Response {
    let request = GatewayRequest {
        surface,
        identity,
        chat,
        trace_id: Some(trace_id.0),
    };
    match state.orchestrator.handle(request).await {
        Ok(GatewayReply::Complete(body)) => json_response(StatusCode::OK, body),
        Ok(GatewayReply::Stream(rx)) => sse_response(rx),
        Err(err) => error_response(&err, protocol),
    }
}

async fn models_list(State(state): State<ProxyState>, headers: HeaderMap) -> Response {
    let ids = state.orchestrator.resolver().list_models();
    let body = if headers.contains_key("anthropic-version") {
        json!({
            "data": ids.iter().map(|id| claude_model(id)).collect::<Vec<_>>(),
            "has_more": false,
            "first_id": ids.first(),
            "last_id": ids.last(),
        })
    } else {
        let created = OffsetDateTime::now_utc().unix_timestamp();
        json!({
            "object": "list",
            "data": ids.iter().map(|id| openai_model(id, created)).collect::<Vec<_>>(),
        })
    };
    json_value_response(StatusCode::OK, &body)
}

async fn models_get(
    State(state): State<ProxyState>,
    Path(model): Path<String>,
    headers: HeaderMap,
) -> Response {
    let anthropic = headers.contains_key("anthropic-version");
    let protocol = if anthropic {
        ClientProtocol::AnthropicMessages
    } else {
        ClientProtocol::OpenAIChat
    };
    let model = model.trim_start_matches('/');
    let listed = state
        .orchestrator
        .resolver()
        .list_models()
        .into_iter()
        .find(|id| id == model);
    let Some(id) = listed else {
        let err = PipelineError::UpstreamRejected {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: format!("model `{model}` does not exist"),
        };
        return error_response(&err, protocol);
    };
    let body = if anthropic {
        claude_model(&id)
    } else {
        openai_model(&id, OffsetDateTime::now_utc().unix_timestamp())
    };
    json_value_response(StatusCode::OK, &body)
}

fn openai_model(id: &str, created: i64) -> Value {
    json!({
        "id": id,
        "object": "model",
        "created": created,
        "owned_by": MODEL_OWNER,
    })
}

fn claude_model(id: &str) -> Value {
    json!({
        "type": "model",
        "id": id,
        "display_name": id,
        "created_at": "1970-01-01T00:00:00Z",
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, PipelineError> {
    serde_json::from_slice(body)
        .map_err(|err| PipelineError::Validation(ValidationError::Malformed(err.to_string())))
}

/// Anthropic callers get Anthropic-shaped errors, including auth failures.
fn protocol_for_path(path: &str, headers: &HeaderMap) -> ClientProtocol {
    if path.starts_with("/v1/messages")
        || (path.starts_with("/v1/models") && headers.contains_key("anthropic-version"))
    {
        ClientProtocol::AnthropicMessages
    } else {
        ClientProtocol::OpenAIChat
    }
}

fn error_response(err: &PipelineError, protocol: ClientProtocol) -> Response {
    let mut resp = json_response(err.status(), err.body(protocol));
    if let Some(retry_after) = err.retry_after() {
        let secs = retry_after.as_secs().max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            resp.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    resp
}

fn json_value_response(status: StatusCode, body: &Value) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => json_response(status, Bytes::from(bytes)),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response(),
    }
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
        })
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(wrap_sse_stream_with_heartbeat(rx)).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        // Hint common reverse proxies to avoid buffering SSE responses.
        .header(header::CACHE_CONTROL, "no-cache")
        .header(HeaderName::from_static("x-accel-buffering"), "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
        })
}

fn wrap_sse_stream_with_heartbeat(
    mut upstream_rx: tokio::sync::mpsc::Receiver<Bytes>,
) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate tick; first heartbeat should be sent after the interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                // Dropping `upstream_rx` is what tells the pipeline the client left.
                _ = tx.closed() => break,
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}
