#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kgate_provider_core::{
    AuthManager, AuthMethod, Credential, CredentialId, CredentialStatus, ExchangeError,
    RefreshPolicy, TokenExchange, TokenGrant,
};
use tokio::sync::Mutex;

/// Token service double: replays scripted results, then issues numbered tokens.
#[derive(Default)]
pub struct ScriptedExchange {
    pub calls: AtomicUsize,
    pub script: Mutex<VecDeque<Result<TokenGrant, ExchangeError>>>,
    pub delay: Duration,
}

impl ScriptedExchange {
    pub fn new(script: Vec<Result<TokenGrant, ExchangeError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchange for ScriptedExchange {
    async fn exchange(
        &self,
        _method: &AuthMethod,
        _region: &str,
    ) -> Result<TokenGrant, ExchangeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(next) = self.script.lock().await.pop_front() {
            return next;
        }
        Ok(grant(&format!("token-{call}")))
    }
}

pub fn grant(access_token: &str) -> TokenGrant {
    TokenGrant {
        access_token: access_token.to_string(),
        refresh_token: None,
        expires_in: 3600,
        profile_arn: None,
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

pub fn fast_policy() -> RefreshPolicy {
    RefreshPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        safety_margin: Duration::from_secs(60),
    }
}

pub fn manager(id: CredentialId, exchange: Arc<ScriptedExchange>) -> Arc<AuthManager> {
    Arc::new(AuthManager::new(
        credential(id),
        exchange,
        fast_policy(),
        "us-east-1",
    ))
}
