use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Default upstream region for credentials that do not name one.
    pub region: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Gateway config file (credentials, keys, mappings, tuning).
    pub config_path: Option<PathBuf>,
    /// Client keys accepted in addition to those in the config file.
    pub client_keys: Vec<String>,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
}

impl GlobalConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub region: Option<String>,
    pub proxy: Option<String>,
    pub config_path: Option<PathBuf>,
    pub client_keys: Option<Vec<String>>,
    pub event_redact_sensitive: Option<bool>,
}

impl GlobalConfigPatch {
    /// Fields set in `other` win.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.region.is_some() {
            self.region = other.region;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.config_path.is_some() {
            self.config_path = other.config_path;
        }
        if other.client_keys.is_some() {
            self.client_keys = other.client_keys;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let region = self.region.unwrap_or_else(|| "us-east-1".to_string());
        if region.trim().is_empty() {
            return Err(GlobalConfigError::MissingField("region"));
        }
        if let Some(proxy) = self.proxy.as_deref()
            && !(proxy.starts_with("http://")
                || proxy.starts_with("https://")
                || proxy.starts_with("socks5://")
                || proxy.starts_with("socks5h://"))
        {
            return Err(GlobalConfigError::Invalid {
                field: "proxy",
                reason: format!("unsupported proxy scheme in {proxy}"),
            });
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            region,
            proxy: self.proxy.filter(|proxy| !proxy.is_empty()),
            config_path: self.config_path,
            client_keys: self.client_keys.unwrap_or_default(),
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            region: Some(value.region),
            proxy: value.proxy,
            config_path: value.config_path,
            client_keys: Some(value.client_keys),
            event_redact_sensitive: Some(value.event_redact_sensitive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_win_and_defaults_fill_gaps() {
        let mut merged = GlobalConfigPatch {
            port: Some(9000),
            region: Some("eu-central-1".to_string()),
            ..Default::default()
        };
        merged.overlay(GlobalConfigPatch {
            port: Some(9100),
            ..Default::default()
        });
        let config = merged.into_config().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.region, "eu-central-1");
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.event_redact_sensitive);
        assert_eq!(config.bind_addr(), "0.0.0.0:9100");
    }

    #[test]
    fn rejects_unknown_proxy_scheme() {
        let patch = GlobalConfigPatch {
            proxy: Some("ftp://proxy".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::Invalid { field: "proxy", .. })
        ));
    }
}
