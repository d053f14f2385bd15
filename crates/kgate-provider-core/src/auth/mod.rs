//! Per-credential bearer token lifecycle.
//!
//! A cached [`AuthSession`] is served without I/O while it is outside the
//! safety margin. Expired or invalidated sessions are refreshed under a
//! per-credential lock; callers that queue on the lock re-check the cache
//! first, so concurrent callers share one refresh.

mod flow;

pub use flow::{ExchangeError, TokenExchange, TokenGrant};

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::{ArcSwap, ArcSwapOption};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::events::{Event, TokenRefreshedEvent};
use crate::{AuthError, Credential, CredentialId, CredentialStatus, EventHub};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub profile_arn: Option<String>,
}

impl AuthSession {
    pub fn is_valid_at(&self, now: i64, margin: Duration) -> bool {
        let margin = i64::try_from(margin.as_secs()).unwrap_or(i64::MAX);
        now < self.expires_at.saturating_sub(margin)
    }
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Total exchange attempts per refresh, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Sessions closer than this to expiry are refreshed before use.
    pub safety_margin: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            safety_margin: Duration::from_secs(60),
        }
    }
}

impl RefreshPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct AuthManager {
    credential: ArcSwap<Credential>,
    session: ArcSwapOption<AuthSession>,
    refresh_lock: Mutex<()>,
    exchange: Arc<dyn TokenExchange>,
    policy: RefreshPolicy,
    default_region: String,
    events: Option<EventHub>,
}

impl AuthManager {
    pub fn new(
        credential: Credential,
        exchange: Arc<dyn TokenExchange>,
        policy: RefreshPolicy,
        default_region: impl Into<String>,
    ) -> Self {
        let session = match (&credential.access_token, credential.expires_at) {
            (Some(access_token), Some(expires_at)) if !access_token.is_empty() => {
                Some(Arc::new(AuthSession {
                    access_token: access_token.clone(),
                    expires_at,
                    profile_arn: credential.profile_arn.clone(),
                }))
            }
            _ => None,
        };
        Self {
            credential: ArcSwap::from_pointee(credential),
            session: ArcSwapOption::new(session),
            refresh_lock: Mutex::new(()),
            exchange,
            policy,
            default_region: default_region.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> CredentialId {
        self.credential.load().id
    }

    /// Current credential record, including rotated tokens.
    pub fn credential(&self) -> Arc<Credential> {
        self.credential.load_full()
    }

    pub fn region(&self) -> String {
        self.credential
            .load()
            .region_or(&self.default_region)
            .to_string()
    }

    pub fn is_disabled(&self) -> bool {
        self.credential.load().is_disabled()
    }

    pub fn cached_session(&self) -> Option<Arc<AuthSession>> {
        self.session.load_full()
    }

    /// Returns a bearer token, refreshing at most once for all concurrent callers.
    pub async fn token(&self) -> Result<Arc<AuthSession>, AuthError> {
        if let Some(session) = self.fresh_session() {
            return Ok(session);
        }
        self.ensure_enabled()?;
        let _guard = self.refresh_lock.lock().await;
        if let Some(session) = self.fresh_session() {
            return Ok(session);
        }
        self.ensure_enabled()?;
        self.refresh_locked().await
    }

    /// Drops the cached session if it still holds `stale_token`, so the next
    /// `token()` re-validates. A session installed by a newer refresh is kept.
    pub fn invalidate(&self, stale_token: &str) {
        self.session.rcu(|current| match current {
            Some(session) if session.access_token == stale_token => None,
            other => other.clone(),
        });
    }

    fn fresh_session(&self) -> Option<Arc<AuthSession>> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.session
            .load_full()
            .filter(|session| session.is_valid_at(now, self.policy.safety_margin))
    }

    fn ensure_enabled(&self) -> Result<(), AuthError> {
        if self.is_disabled() {
            return Err(AuthError::Disabled {
                credential_id: self.id(),
                reason: "credential is disabled".to_string(),
            });
        }
        Ok(())
    }

    async fn refresh_locked(&self) -> Result<Arc<AuthSession>, AuthError> {
        let credential = self.credential.load_full();
        let region = credential.region_or(&self.default_region).to_string();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.exchange.exchange(&credential.auth, &region).await {
                Ok(grant) => return Ok(self.install(&credential, grant).await),
                Err(ExchangeError::InvalidCredential(reason)) => {
                    warn!(
                        event = "auth_refresh_rejected",
                        phase = "auth_refresh",
                        credential = credential.id,
                        method = credential.auth.kind(),
                        reason = %reason,
                    );
                    self.disable(&credential);
                    return Err(AuthError::Disabled {
                        credential_id: credential.id,
                        reason,
                    });
                }
                Err(err) if err.is_retryable() && attempt < self.policy.attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        event = "auth_refresh_retry",
                        phase = "auth_refresh",
                        credential = credential.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        event = "auth_refresh_failed",
                        phase = "auth_refresh",
                        credential = credential.id,
                        attempt,
                        error = %err,
                    );
                    return Err(AuthError::RefreshFailed {
                        credential_id: credential.id,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    async fn install(&self, credential: &Credential, grant: TokenGrant) -> Arc<AuthSession> {
        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + grant.expires_in;
        let rotated = grant
            .refresh_token
            .as_deref()
            .is_some_and(|next| next != credential.auth.refresh_token());

        let mut updated = credential.clone();
        if let Some(next) = grant.refresh_token {
            updated.auth.rotate(next);
        }
        if grant.profile_arn.is_some() {
            updated.profile_arn = grant.profile_arn;
        }
        updated.access_token = Some(grant.access_token.clone());
        updated.expires_at = Some(expires_at);

        let session = Arc::new(AuthSession {
            access_token: grant.access_token,
            expires_at,
            profile_arn: updated.profile_arn.clone(),
        });
        self.credential.store(Arc::new(updated));
        self.session.store(Some(session.clone()));

        info!(
            event = "token_refreshed",
            credential = credential.id,
            method = credential.auth.kind(),
            expires_at,
            rotated,
        );
        if let Some(events) = &self.events {
            events
                .emit(Event::TokenRefreshed(TokenRefreshedEvent {
                    at: SystemTime::now(),
                    credential_id: credential.id,
                    expires_at,
                    rotated,
                }))
                .await;
        }
        session
    }

    fn disable(&self, credential: &Credential) {
        let mut updated = credential.clone();
        updated.status = CredentialStatus::Disabled;
        updated.access_token = None;
        updated.expires_at = None;
        self.credential.store(Arc::new(updated));
        self.session.store(None);
    }
}
