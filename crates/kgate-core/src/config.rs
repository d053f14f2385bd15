//! Gateway config file: credentials, client keys, model mappings and tuning.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kgate_common::GlobalConfigPatch;
use kgate_provider_core::{Credential, CredentialId, ModelMappings, PoolPolicy};
use kgate_transform::compress::CompressionConfig;
use serde::{Deserialize, Serialize};

use crate::truncation::TruncationConfig;
use crate::upstream::UpstreamSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKeyConfig {
    pub key: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Credential this key's requests prefer while it is usable.
    #[serde(default)]
    pub sticky_credential: Option<CredentialId>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub auth_cooldown_secs: u64,
    pub quota_cooldown_secs: u64,
    pub transient_cooldown_secs: u64,
    pub transient_threshold: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let policy = PoolPolicy::default();
        Self {
            auth_cooldown_secs: policy.auth_cooldown.as_secs(),
            quota_cooldown_secs: policy.quota_cooldown.as_secs(),
            transient_cooldown_secs: policy.transient_cooldown.as_secs(),
            transient_threshold: policy.transient_threshold,
        }
    }
}

impl PoolSettings {
    pub fn policy(&self) -> PoolPolicy {
        PoolPolicy {
            auth_cooldown: Duration::from_secs(self.auth_cooldown_secs),
            quota_cooldown: Duration::from_secs(self.quota_cooldown_secs),
            transient_cooldown: Duration::from_secs(self.transient_cooldown_secs),
            transient_threshold: self.transient_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningSettings {
    /// `max_thinking_length` injected when the caller gave no budget.
    pub default_budget: u32,
}

impl Default for ReasoningSettings {
    fn default() -> Self {
        Self {
            default_budget: 4000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Process settings; CLI flags and env vars override these.
    pub server: GlobalConfigPatch,
    pub credentials: Vec<Credential>,
    /// Rotated tokens are written here and overlaid on `credentials` at startup.
    pub credential_state_path: Option<PathBuf>,
    pub client_keys: Vec<ClientKeyConfig>,
    pub aliases: BTreeMap<String, String>,
    pub combos: BTreeMap<String, Vec<String>>,
    pub compression: CompressionConfig,
    pub truncation: TruncationConfig,
    pub upstream: UpstreamSettings,
    pub pool: PoolSettings,
    pub reasoning: ReasoningSettings,
    /// Max input tokens per model id, used when the upstream listing has none.
    pub model_limits: BTreeMap<String, u64>,
}

impl GatewayConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: display.clone(),
                source,
            })?;
        let config: GatewayConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for credential in &self.credentials {
            if !ids.insert(credential.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate credential id {}",
                    credential.id
                )));
            }
            if credential.auth.refresh_token().trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "credential {} has an empty refresh token",
                    credential.id
                )));
            }
        }
        let mut keys = HashSet::new();
        for entry in &self.client_keys {
            if entry.key.trim().is_empty() {
                return Err(ConfigError::Invalid("empty client key".to_string()));
            }
            if !keys.insert(entry.key.as_str()) {
                return Err(ConfigError::Invalid("duplicate client key".to_string()));
            }
        }
        let compression = &self.compression;
        if !(compression.target_ratio > 0.0
            && compression.target_ratio <= compression.trigger_ratio
            && compression.trigger_ratio <= 1.0)
        {
            return Err(ConfigError::Invalid(
                "compression ratios must satisfy 0 < target <= trigger <= 1".to_string(),
            ));
        }
        if compression.context_window == 0 || compression.chars_per_token <= 0.0 {
            return Err(ConfigError::Invalid(
                "compression window and chars_per_token must be positive".to_string(),
            ));
        }
        if self.combos.values().any(Vec::is_empty) {
            return Err(ConfigError::Invalid("combo without members".to_string()));
        }
        Ok(())
    }

    pub fn mappings(&self) -> ModelMappings {
        ModelMappings::builtin().merged(ModelMappings {
            aliases: self.aliases.clone(),
            combos: self.combos.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_provider_core::AuthMethod;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "server": {"port": 9000},
        "credentials": [
            {"id": 1, "method": "refresh_token", "refresh_token": "r1"},
            {"id": 2, "method": "client_credentials", "clientId": "c", "clientSecret": "s",
             "refreshToken": "r2", "region": "eu-central-1"}
        ],
        "client_keys": [{"key": "sk-team", "user": "team", "sticky_credential": 2}],
        "aliases": {"fast": "claude-haiku-4.5"},
        "combos": {"mix": ["claude-sonnet-4.5", "claude-opus-4.5"]},
        "compression": {"context_window": 200000},
        "upstream": {"first_token_timeout_secs": 20}
    }"#;

    #[test]
    fn parses_and_fills_defaults() {
        let config: GatewayConfig = serde_json::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, Some(9000));
        assert_eq!(config.credentials.len(), 2);
        assert!(matches!(
            config.credentials[1].auth,
            AuthMethod::ClientCredentials { .. }
        ));
        assert_eq!(config.client_keys[0].sticky_credential, Some(2));
        assert!(config.client_keys[0].enabled);
        assert_eq!(config.compression.context_window, 200_000);
        assert_eq!(config.compression.trigger_ratio, 0.70);
        assert_eq!(config.upstream.first_token_timeout_secs, 20);
        assert_eq!(config.upstream.stream_idle_timeout_secs, 30);
        assert_eq!(config.truncation.short_reply_tokens, 30);
        assert_eq!(config.pool.policy(), PoolPolicy::default());

        let mappings = config.mappings();
        assert_eq!(mappings.aliases["fast"], "claude-haiku-4.5");
        assert_eq!(mappings.aliases["kiro-opus-4-6"], "claude-opus-4.6");
        assert_eq!(mappings.combos["mix"].len(), 2);
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_ratios() {
        let mut config: GatewayConfig = serde_json::from_str(SAMPLE).unwrap();
        config.credentials[1].id = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config: GatewayConfig = serde_json::from_str(SAMPLE).unwrap();
        config.compression.target_ratio = 0.9;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
