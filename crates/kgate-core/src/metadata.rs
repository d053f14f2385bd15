//! Upstream model catalog: fetched at startup, refreshed on an interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kgate_protocol::kiro::{ModelInfo, TokenLimits};
use kgate_provider_core::{CredentialPool, ModelCatalog, ModelResolver};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::upstream::Upstream;

const FALLBACK_INPUT_TOKENS: u64 = 200_000;

/// Served when no credential can list models.
pub const FALLBACK_MODELS: &[&str] = &[
    "claude-opus-4.6",
    "claude-sonnet-4.6",
    "claude-opus-4.5",
    "claude-sonnet-4.5",
    "claude-sonnet-4",
    "claude-haiku-4.5",
    "claude-3.7-sonnet",
];

pub fn fallback_catalog(limits: &BTreeMap<String, u64>) -> ModelCatalog {
    ModelCatalog::new(
        FALLBACK_MODELS
            .iter()
            .map(|model| ModelInfo {
                model_id: model.to_string(),
                model_name: None,
                description: None,
                token_limits: Some(TokenLimits {
                    max_input_tokens: Some(
                        limits.get(*model).copied().unwrap_or(FALLBACK_INPUT_TOKENS),
                    ),
                    max_output_tokens: None,
                }),
            })
            .collect(),
    )
}

/// Fills missing input limits from config.
fn apply_limits(mut models: Vec<ModelInfo>, limits: &BTreeMap<String, u64>) -> Vec<ModelInfo> {
    for model in &mut models {
        let Some(limit) = limits.get(&model.model_id) else {
            continue;
        };
        let token_limits = model.token_limits.get_or_insert_with(TokenLimits::default);
        if token_limits.max_input_tokens.is_none() {
            token_limits.max_input_tokens = Some(*limit);
        }
    }
    models
}

pub struct MetadataRefresher {
    pool: Arc<CredentialPool>,
    resolver: Arc<ModelResolver>,
    upstream: Arc<dyn Upstream>,
    limits: BTreeMap<String, u64>,
}

impl MetadataRefresher {
    pub fn new(
        pool: Arc<CredentialPool>,
        resolver: Arc<ModelResolver>,
        upstream: Arc<dyn Upstream>,
        limits: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            pool,
            resolver,
            upstream,
            limits,
        }
    }

    /// Tries credentials in rotation order until one lists models. Returns
    /// whether the upstream catalog was installed; on failure the current
    /// catalog stays, or the fallback list if there is none yet.
    pub async fn refresh_once(&self) -> bool {
        for manager in self.pool.managers().await {
            if manager.is_disabled() {
                continue;
            }
            let session = match manager.token().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(
                        event = "model_list_failed",
                        phase = "token",
                        credential = manager.id(),
                        error = %err,
                    );
                    continue;
                }
            };
            let profile_arn = session
                .profile_arn
                .clone()
                .or_else(|| manager.credential().profile_arn.clone());
            match self
                .upstream
                .list_models(
                    &manager.region(),
                    &session.access_token,
                    profile_arn.as_deref(),
                )
                .await
            {
                Ok(response) if !response.models.is_empty() => {
                    let models = apply_limits(response.models, &self.limits);
                    info!(
                        event = "model_list_refreshed",
                        credential = manager.id(),
                        models = models.len(),
                    );
                    self.resolver.replace_catalog(ModelCatalog::new(models));
                    return true;
                }
                Ok(_) => {
                    warn!(
                        event = "model_list_failed",
                        phase = "list",
                        credential = manager.id(),
                        error = "empty model list",
                    );
                }
                Err(err) => {
                    warn!(
                        event = "model_list_failed",
                        phase = "list",
                        credential = manager.id(),
                        error = %err,
                    );
                }
            }
        }
        if self.resolver.catalog().is_empty() {
            warn!(event = "model_list_fallback", models = FALLBACK_MODELS.len());
            self.resolver.replace_catalog(fallback_catalog(&self.limits));
        }
        false
    }

    /// Refreshes now, then every `interval` until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.refresh_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_honours_configured_limits() {
        let mut limits = BTreeMap::new();
        limits.insert("claude-sonnet-4".to_string(), 100_000);
        let catalog = fallback_catalog(&limits);
        assert_eq!(catalog.len(), FALLBACK_MODELS.len());
        assert_eq!(catalog.max_input_tokens("claude-sonnet-4"), Some(100_000));
        assert_eq!(catalog.max_input_tokens("claude-opus-4.6"), Some(200_000));
    }

    #[test]
    fn listed_limits_are_not_overridden() {
        let mut limits = BTreeMap::new();
        limits.insert("a".to_string(), 1);
        limits.insert("b".to_string(), 2);
        let models = apply_limits(
            vec![
                ModelInfo {
                    model_id: "a".to_string(),
                    model_name: None,
                    description: None,
                    token_limits: Some(TokenLimits {
                        max_input_tokens: Some(50),
                        max_output_tokens: None,
                    }),
                },
                ModelInfo {
                    model_id: "b".to_string(),
                    model_name: None,
                    description: None,
                    token_limits: None,
                },
            ],
            &limits,
        );
        assert_eq!(models[0].token_limits.as_ref().unwrap().max_input_tokens, Some(50));
        assert_eq!(models[1].token_limits.as_ref().unwrap().max_input_tokens, Some(2));
    }
}
