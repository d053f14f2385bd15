use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use kgate_protocol::kiro::ListAvailableModelsResponse;
use kgate_provider_core::{AuthMethod, CredentialId, ExchangeError, TokenExchange, TokenGrant};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;
use wreq::header::RETRY_AFTER;
use wreq::{Client, Method, Proxy};

use super::{
    TransportKind, Upstream, UpstreamCall, UpstreamClientConfig, UpstreamError, UpstreamStream,
    parse_retry_after, q_host,
};

const SDK_VERSION: &str = "1.0.27";
const IDE_VERSION: &str = "0.7.45";
const STREAM_BUFFER: usize = 16;

/// `wreq` clients cached per egress proxy.
#[derive(Clone)]
pub struct WreqUpstream {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl WreqUpstream {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        let initial = build_client(&config, proxy.as_deref())?;
        let mut clients = HashMap::new();
        clients.insert(proxy, initial);
        Ok(Self {
            config,
            clients: Arc::new(Mutex::new(clients)),
        })
    }

    fn client(&self) -> Result<Client, UpstreamError> {
        let proxy = normalize_proxy(self.config.proxy.clone());
        let mut guard = self.clients.lock().map_err(|_| UpstreamError::Transport {
            kind: TransportKind::Other,
            message: "upstream client cache lock failed".to_string(),
        })?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref()).map_err(map_wreq_error)?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

/// Stable per-credential fingerprint carried in the IDE user agent.
fn fingerprint(credential_id: CredentialId) -> String {
    let digest = Sha256::digest(format!("kgate-credential-{credential_id}").as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn kiro_headers(credential_id: CredentialId, access_token: &str) -> Vec<(&'static str, String)> {
    let fingerprint = fingerprint(credential_id);
    vec![
        ("authorization", format!("Bearer {access_token}")),
        ("content-type", "application/json".to_string()),
        ("accept", "*/*".to_string()),
        ("x-amzn-codewhisperer-optout", "true".to_string()),
        ("x-amzn-kiro-agent-mode", "vibe".to_string()),
        ("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string()),
        ("amz-sdk-request", "attempt=1; max=3".to_string()),
        (
            "user-agent",
            format!(
                "aws-sdk-js/{SDK_VERSION} ua/2.1 os/{} lang/js md/nodejs#22.21.1 api/codewhispererstreaming#{SDK_VERSION} m/E KiroIDE-{IDE_VERSION}-{fingerprint}",
                std::env::consts::OS
            ),
        ),
        (
            "x-amz-user-agent",
            format!("aws-sdk-js/{SDK_VERSION} KiroIDE-{IDE_VERSION}-{fingerprint}"),
        ),
    ]
}

async fn error_for_status(resp: wreq::Response) -> UpstreamError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    UpstreamError::Status {
        status,
        retry_after,
        body,
    }
}

#[async_trait]
impl Upstream for WreqUpstream {
    async fn generate(&self, call: UpstreamCall) -> Result<UpstreamStream, UpstreamError> {
        let client = self.client()?;
        let url = format!("{}/generateAssistantResponse", q_host(&call.region));
        let body = serde_json::to_vec(&call.payload)
            .map_err(|err| UpstreamError::Decode(err.to_string()))?;
        let mut builder = client.request(Method::POST, &url);
        for (name, value) in kiro_headers(call.credential_id, &call.access_token) {
            builder = builder.header(name, value);
        }
        debug!(
            event = "upstream_send",
            trace_id = %call.trace_id,
            credential = call.credential_id,
            bytes = body.len(),
        );
        let resp = builder.body(body).send().await.map_err(map_wreq_error)?;
        if !resp.status().is_success() {
            return Err(error_for_status(resp).await);
        }

        let idle = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let body = resp
            .bytes_stream()
            .map(|item| item.map_err(map_wreq_error));
        tokio::spawn(pump_body(body, tx, idle));
        Ok(rx)
    }

    async fn list_models(
        &self,
        region: &str,
        access_token: &str,
        profile_arn: Option<&str>,
    ) -> Result<ListAvailableModelsResponse, UpstreamError> {
        let client = self.client()?;
        let url = format!("{}/ListAvailableModels", q_host(region));
        let mut query = vec![("origin", "AI_EDITOR")];
        if let Some(arn) = profile_arn {
            query.push(("profileArn", arn));
        }
        let mut builder = client.request(Method::GET, &url).query(&query);
        for (name, value) in kiro_headers(0, access_token) {
            builder = builder.header(name, value);
        }
        let resp = builder.send().await.map_err(map_wreq_error)?;
        if !resp.status().is_success() {
            return Err(error_for_status(resp).await);
        }
        let bytes = resp.bytes().await.map_err(map_wreq_error)?;
        serde_json::from_slice(&bytes).map_err(|err| UpstreamError::Decode(err.to_string()))
    }
}

/// Token refresh over HTTP for both auth flows.
#[derive(Clone)]
pub struct WreqTokenExchange {
    client: Client,
}

impl WreqTokenExchange {
    pub fn new(config: &UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let refresh = UpstreamClientConfig {
            request_timeout: Duration::from_secs(30),
            ..config.clone()
        };
        Ok(Self {
            client: build_client(&refresh, normalize_proxy(config.proxy.clone()).as_deref())?,
        })
    }
}

#[async_trait]
impl TokenExchange for WreqTokenExchange {
    async fn exchange(
        &self,
        method: &AuthMethod,
        region: &str,
    ) -> Result<TokenGrant, ExchangeError> {
        let body = serde_json::to_vec(&method.refresh_body())
            .map_err(|err| ExchangeError::Malformed(err.to_string()))?;
        let resp = self
            .client
            .request(Method::POST, method.refresh_url(region))
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .header("user-agent", format!("KiroIDE-{IDE_VERSION}"))
            .body(body)
            .send()
            .await
            .map_err(|err| ExchangeError::Transport(err.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|err| ExchangeError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(ExchangeError::from_status(status, &text));
        }
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|err| ExchangeError::Malformed(err.to_string()))?;
        TokenGrant::from_json(&value)
    }
}

fn map_wreq_error(err: wreq::Error) -> UpstreamError {
    UpstreamError::Transport {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportKind::ReadTimeout;
        }
        return TransportKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportKind::Tls;
        }
        return TransportKind::Connect;
    }
    if err.is_connection_reset() {
        return TransportKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportKind::Tls;
    }
    TransportKind::Other
}

/// Forwards body chunks until the body ends, fails, stalls for `idle`, or the
/// receiver is dropped. Returning drops the body, which aborts the read.
async fn pump_body<S>(body: S, tx: mpsc::Sender<Result<Bytes, UpstreamError>>, idle: Duration)
where
    S: Stream<Item = Result<Bytes, UpstreamError>>,
{
    let mut body = std::pin::pin!(body);
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => break,
            next = tokio::time::timeout(idle, body.next()) => next,
        };
        let item = match next {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                let _ = tx.send(Err(UpstreamError::Stalled(idle))).await;
                break;
            }
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}
