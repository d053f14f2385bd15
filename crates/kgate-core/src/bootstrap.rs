use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use kgate_common::{GlobalConfig, GlobalConfigPatch};
use kgate_provider_core::{
    AuthManager, CredentialPool, EventHub, ModelResolver, RefreshPolicy, TerminalEventSink,
};

use crate::auth::{ClientAuthenticator, KeySnapshot, MemoryClientKeys, OpenAccess};
use crate::config::{ClientKeyConfig, GatewayConfig};
use crate::metadata::MetadataRefresher;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::store::{CredentialPersistSink, CredentialStore, FileCredentialStore, merge_credentials};
use crate::upstream::{Upstream, UpstreamClientConfig, WreqTokenExchange, WreqUpstream};
use crate::usage::LogUsageSink;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "kgate",
    version,
    about = "OpenAI and Anthropic compatible gateway for Kiro credentials"
)]
pub struct CliArgs {
    /// Gateway config file (JSON).
    #[arg(long, env = "KGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind host.
    #[arg(long, env = "KGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "KGATE_PORT")]
    pub port: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "KGATE_PROXY")]
    pub proxy: Option<String>,

    /// Region for credentials that do not name one.
    #[arg(long, env = "KGATE_REGION")]
    pub region: Option<String>,

    /// Client API key; repeat the flag or comma-separate in the env var.
    #[arg(long = "client-key", env = "KGATE_CLIENT_KEYS", value_delimiter = ',')]
    pub client_keys: Vec<String>,

    /// Redact sensitive fields in emitted events.
    #[arg(long, env = "KGATE_EVENT_REDACT_SENSITIVE")]
    pub event_redact_sensitive: Option<String>,
}

pub struct Bootstrap {
    pub global: GlobalConfig,
    pub orchestrator: Orchestrator,
    pub authenticator: Arc<dyn ClientAuthenticator>,
    /// Background model-list refresh; abort on shutdown.
    pub metadata_task: JoinHandle<()>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let cli_patch = cli_patch(args)?;

    // 1) config file, located by CLI/ENV only.
    let config = match cli_patch.config_path.as_deref() {
        Some(path) => GatewayConfig::load(path)
            .await
            .with_context(|| format!("load config {}", path.display()))?,
        None => {
            warn!(event = "config_missing", "no config file given; starting without credentials");
            GatewayConfig::default()
        }
    };

    // 2) merge once: CLI > ENV > config file > defaults.
    // clap already applies CLI > ENV precedence for each field; we then overlay on the file.
    let mut merged = config.server.clone();
    merged.overlay(cli_patch);
    let global = merged
        .into_config()
        .context("finalize merged global config")?;

    // 3) credentials: configured, overlaid with rotated state from disk.
    let store: Option<Arc<dyn CredentialStore>> = match config.credential_state_path.clone() {
        Some(path) => Some(Arc::new(
            FileCredentialStore::open(path)
                .await
                .context("open credential state")?,
        )),
        None => None,
    };
    let credentials = match &store {
        Some(store) => merge_credentials(
            config.credentials.clone(),
            store
                .load_credentials()
                .await
                .context("load credential state")?,
        ),
        None => config.credentials.clone(),
    };

    // 4) in-memory state; runtime reads never touch the config or store again.
    let events = EventHub::new(1024);
    events
        .add_sink(Arc::new(TerminalEventSink::redacted(
            global.event_redact_sensitive,
        )))
        .await;

    let client_config = UpstreamClientConfig::new(&config.upstream, global.proxy.clone());
    let exchange =
        Arc::new(WreqTokenExchange::new(&client_config).context("build token client")?);
    let upstream: Arc<dyn Upstream> =
        Arc::new(WreqUpstream::new(client_config).context("build upstream client")?);

    let pool = Arc::new(CredentialPool::new(events.clone(), config.pool.policy()));
    for credential in credentials {
        let manager = AuthManager::new(
            credential,
            exchange.clone(),
            RefreshPolicy::default(),
            global.region.clone(),
        )
        .with_events(events.clone());
        pool.insert(Arc::new(manager)).await;
    }
    if let Some(store) = store {
        events
            .add_sink(Arc::new(CredentialPersistSink::new(&pool, store)))
            .await;
    }

    let resolver = Arc::new(ModelResolver::new(config.mappings()));
    let metadata_task = MetadataRefresher::new(
        pool.clone(),
        resolver.clone(),
        upstream.clone(),
        config.model_limits.clone(),
    )
    .spawn(config.upstream.metadata_refresh());

    let settings = OrchestratorSettings {
        upstream: config.upstream.clone(),
        truncation: config.truncation.clone(),
        compression: config.compression.clone(),
        default_thinking_budget: config.reasoning.default_budget,
        ..OrchestratorSettings::default()
    };
    let orchestrator = Orchestrator::new(pool.clone(), resolver, upstream, settings)
        .with_usage_sink(Arc::new(LogUsageSink));

    let keys = client_keys(&config.client_keys, &global.client_keys);
    let authenticator: Arc<dyn ClientAuthenticator> = if keys.is_empty() {
        warn!(event = "client_auth_disabled", "no client keys configured; accepting every caller");
        Arc::new(OpenAccess)
    } else {
        Arc::new(MemoryClientKeys::new(keys))
    };

    info!(
        event = "bootstrap_complete",
        bind = %global.bind_addr(),
        region = %global.region,
        credentials = pool.len().await,
    );

    Ok(Bootstrap {
        global,
        orchestrator,
        authenticator,
        metadata_task,
    })
}

fn cli_patch(args: CliArgs) -> anyhow::Result<GlobalConfigPatch> {
    let client_keys: Vec<String> = args
        .client_keys
        .into_iter()
        .filter_map(|key| sanitize_optional_env_value(Some(key)))
        .collect();
    Ok(GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host),
        port: parse_u16_env_value(args.port, "KGATE_PORT")?,
        region: sanitize_optional_env_value(args.region),
        proxy: sanitize_optional_env_value(args.proxy),
        config_path: args.config.filter(|path| !path.as_os_str().is_empty()),
        client_keys: (!client_keys.is_empty()).then_some(client_keys),
        event_redact_sensitive: parse_bool_env_value(
            args.event_redact_sensitive,
            "KGATE_EVENT_REDACT_SENSITIVE",
        )?,
    })
}

/// File keys keep their settings; CLI keys are added as plain enabled keys.
fn client_keys(configured: &[ClientKeyConfig], extra: &[String]) -> KeySnapshot {
    let mut keys = configured.to_vec();
    for key in extra {
        if keys.iter().any(|entry| entry.key == *key) {
            continue;
        }
        keys.push(ClientKeyConfig {
            key: key.clone(),
            user: None,
            enabled: true,
            sticky_credential: None,
        });
    }
    KeySnapshot::from_config(&keys)
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems may inject unresolved placeholders like `${VAR}`.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_and_blanks_are_unset() {
        let patch = cli_patch(CliArgs {
            host: Some("${KGATE_HOST}".to_string()),
            port: Some(" 9100 ".to_string()),
            proxy: Some("   ".to_string()),
            client_keys: vec!["sk-a".to_string(), " ".to_string()],
            event_redact_sensitive: Some("off".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(patch.host, None);
        assert_eq!(patch.port, Some(9100));
        assert_eq!(patch.proxy, None);
        assert_eq!(patch.client_keys, Some(vec!["sk-a".to_string()]));
        assert_eq!(patch.event_redact_sensitive, Some(false));
    }

    #[test]
    fn rejects_malformed_numbers_and_flags() {
        assert!(
            cli_patch(CliArgs {
                port: Some("eighty".to_string()),
                ..Default::default()
            })
            .is_err()
        );
        assert!(
            cli_patch(CliArgs {
                event_redact_sensitive: Some("maybe".to_string()),
                ..Default::default()
            })
            .is_err()
        );
    }

    #[test]
    fn cli_keys_extend_configured_ones() {
        let configured = vec![ClientKeyConfig {
            key: "sk-team".to_string(),
            user: Some("team".to_string()),
            enabled: false,
            sticky_credential: None,
        }];
        let snapshot = client_keys(&configured, &["sk-team".to_string(), "sk-ops".to_string()]);
        assert_eq!(snapshot.len(), 2);
        assert!(client_keys(&[], &[]).is_empty());
    }

    #[tokio::test]
    async fn starts_without_a_config_file() {
        let boot = bootstrap(CliArgs {
            port: Some("0".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(boot.global.port, 0);
        assert_eq!(boot.global.region, "us-east-1");
        assert!(boot.orchestrator.pool().is_empty().await);
        boot.metadata_task.abort();
    }
}
