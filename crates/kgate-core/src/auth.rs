//! Client API keys: who is calling, and which credential they stick to.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;
use kgate_provider_core::CredentialId;

use crate::config::ClientKeyConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Attribution for usage records.
    pub user: Option<String>,
    pub sticky: Option<CredentialId>,
}

pub trait ClientAuthenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<ClientIdentity, PipelineError>;
}

/// Accepts every caller. Used when no client keys are configured.
#[derive(Debug, Default)]
pub struct OpenAccess;

impl ClientAuthenticator for OpenAccess {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<ClientIdentity, PipelineError> {
        Ok(ClientIdentity::default())
    }
}

#[derive(Debug, Clone)]
struct KeyEntry {
    user: Option<String>,
    enabled: bool,
    sticky: Option<CredentialId>,
}

#[derive(Debug, Clone, Default)]
pub struct KeySnapshot {
    keys_by_value: HashMap<String, KeyEntry>,
}

impl KeySnapshot {
    pub fn from_config(keys: &[ClientKeyConfig]) -> Self {
        Self {
            keys_by_value: keys
                .iter()
                .map(|entry| {
                    (
                        entry.key.trim().to_string(),
                        KeyEntry {
                            user: entry.user.clone(),
                            enabled: entry.enabled,
                            sticky: entry.sticky_credential,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys_by_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys_by_value.is_empty()
    }
}

#[derive(Debug)]
pub struct MemoryClientKeys {
    snapshot: ArcSwap<KeySnapshot>,
}

impl MemoryClientKeys {
    pub fn new(snapshot: KeySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: KeySnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl ClientAuthenticator for MemoryClientKeys {
    fn authenticate(&self, headers: &HeaderMap) -> Result<ClientIdentity, PipelineError> {
        let api_key = extract_api_key(headers).ok_or(PipelineError::InvalidApiKey)?;

        let snapshot = self.snapshot.load();
        let entry = snapshot
            .keys_by_value
            .get(api_key.as_str())
            .ok_or(PipelineError::InvalidApiKey)?;

        if !entry.enabled {
            return Err(PipelineError::AccountDisabled);
        }

        Ok(ClientIdentity {
            user: entry.user.clone(),
            sticky: entry.sticky,
        })
    }
}

/// `x-api-key` first, then `Authorization: Bearer`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn keys() -> MemoryClientKeys {
        MemoryClientKeys::new(KeySnapshot::from_config(&[
            ClientKeyConfig {
                key: "sk-live".to_string(),
                user: Some("alice".to_string()),
                enabled: true,
                sticky_credential: Some(3),
            },
            ClientKeyConfig {
                key: "sk-off".to_string(),
                user: None,
                enabled: false,
                sticky_credential: None,
            },
        ]))
    }

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_either_header() {
        let keys = keys();
        let by_header = keys.authenticate(&headers("x-api-key", "sk-live")).unwrap();
        let by_bearer = keys
            .authenticate(&headers("authorization", "Bearer sk-live"))
            .unwrap();
        assert_eq!(by_header, by_bearer);
        assert_eq!(by_header.user.as_deref(), Some("alice"));
        assert_eq!(by_header.sticky, Some(3));
    }

    #[test]
    fn rejects_missing_unknown_and_disabled() {
        let keys = keys();
        assert!(matches!(
            keys.authenticate(&HeaderMap::new()),
            Err(PipelineError::InvalidApiKey)
        ));
        assert!(matches!(
            keys.authenticate(&headers("authorization", "Bearer nope")),
            Err(PipelineError::InvalidApiKey)
        ));
        assert!(matches!(
            keys.authenticate(&headers("authorization", "Basic sk-live")),
            Err(PipelineError::InvalidApiKey)
        ));
        assert!(matches!(
            keys.authenticate(&headers("x-api-key", "sk-off")),
            Err(PipelineError::AccountDisabled)
        ));
    }

    #[test]
    fn snapshot_swap_takes_effect() {
        let keys = keys();
        keys.replace_snapshot(KeySnapshot::default());
        assert!(keys.authenticate(&headers("x-api-key", "sk-live")).is_err());
        assert!(OpenAccess.authenticate(&HeaderMap::new()).is_ok());
    }
}
