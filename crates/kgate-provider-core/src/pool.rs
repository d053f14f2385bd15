use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::credential::RecoveryQueue;
use crate::events::{CredentialDisabledEvent, Event, UnavailableStartEvent};
use crate::{
    AuthError, AuthManager, AuthSession, CredentialId, CredentialState, EventHub, PoolExhausted,
    UnavailableReason,
};

/// How long each kind of failure keeps a credential out of rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    pub auth_cooldown: Duration,
    pub quota_cooldown: Duration,
    pub transient_cooldown: Duration,
    /// Consecutive transient failures before a transient cooldown applies.
    pub transient_threshold: u32,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            auth_cooldown: Duration::from_secs(300),
            quota_cooldown: Duration::from_secs(3600),
            transient_cooldown: Duration::from_secs(30),
            transient_threshold: 3,
        }
    }
}

/// Result of one use of a credential, reported back by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The upstream rejected the bearer token.
    AuthFailure,
    /// The token service rejected the credential itself.
    Revoked(String),
    QuotaExceeded { retry_after: Option<Duration> },
    Transient,
    /// The caller went away; says nothing about credential health.
    Released,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::AuthFailure => "auth_failure",
            Outcome::Revoked(_) => "revoked",
            Outcome::QuotaExceeded { .. } => "quota_exceeded",
            Outcome::Transient => "transient",
            Outcome::Released => "released",
        }
    }
}

struct Slot {
    manager: Arc<AuthManager>,
    state: CredentialState,
    use_count: u64,
    last_used: Option<SystemTime>,
    consecutive_transient: u32,
    in_flight: Arc<AtomicUsize>,
}

impl Slot {
    fn is_selectable(&self, now: Instant) -> bool {
        self.state.is_selectable(now) && !self.manager.is_disabled()
    }
}

/// Rotation cursor and per-credential state, guarded by one lock.
pub(crate) struct PoolState {
    order: Vec<CredentialId>,
    cursor: usize,
    slots: HashMap<CredentialId, Slot>,
}

impl PoolState {
    /// Returns an unavailable credential to rotation if its deadline has passed.
    pub(crate) fn recover(&mut self, id: CredentialId, now: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        match slot.state {
            CredentialState::Unavailable { until, .. } if until <= now => {
                slot.state = CredentialState::Active;
                true
            }
            _ => false,
        }
    }

    fn selectable(&self, id: CredentialId, now: Instant) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|slot| slot.is_selectable(now))
    }

    fn select(&mut self, sticky: Option<CredentialId>, now: Instant) -> Option<CredentialId> {
        if let Some(id) = sticky
            && self.selectable(id, now)
        {
            return Some(id);
        }
        let len = self.order.len();
        for step in 0..len {
            let index = (self.cursor + step) % len;
            let id = self.order[index];
            if self.selectable(id, now) {
                self.cursor = (index + 1) % len;
                return Some(id);
            }
        }
        None
    }
}

/// A credential checked out for one request.
///
/// Dropping the handle releases it; [`CredentialPool::report`] also records health.
pub struct CredentialHandle {
    id: CredentialId,
    manager: Arc<AuthManager>,
    sticky: bool,
    issued: Option<String>,
    in_flight: Arc<AtomicUsize>,
}

impl CredentialHandle {
    pub fn id(&self) -> CredentialId {
        self.id
    }

    pub fn manager(&self) -> &Arc<AuthManager> {
        &self.manager
    }

    pub fn region(&self) -> String {
        self.manager.region()
    }

    /// Whether the caller's sticky binding selected this credential.
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    pub async fn token(&mut self) -> Result<Arc<AuthSession>, AuthError> {
        let session = self.manager.token().await?;
        self.issued = Some(session.access_token.clone());
        Ok(session)
    }
}

impl Drop for CredentialHandle {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("id", &self.id)
            .field("sticky", &self.sticky)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: CredentialId,
    pub method: &'static str,
    pub region: String,
    pub state: &'static str,
    pub reason: Option<String>,
    pub use_count: u64,
    pub last_used: Option<SystemTime>,
    pub in_flight: usize,
}

pub struct CredentialPool {
    state: Arc<Mutex<PoolState>>,
    events: EventHub,
    queue: Arc<RecoveryQueue>,
    policy: PoolPolicy,
}

impl CredentialPool {
    /// Must be called inside a tokio runtime; spawns the recovery task.
    pub fn new(events: EventHub, policy: PoolPolicy) -> Self {
        let state = Arc::new(Mutex::new(PoolState {
            order: Vec::new(),
            cursor: 0,
            slots: HashMap::new(),
        }));
        let queue = Arc::new(RecoveryQueue::new());
        queue
            .clone()
            .spawn_recover_task(Arc::downgrade(&state), events.clone());
        Self {
            state,
            events,
            queue,
            policy,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn insert(&self, manager: Arc<AuthManager>) {
        let id = manager.id();
        let state = if manager.is_disabled() {
            CredentialState::Disabled {
                reason: "disabled in store".to_string(),
            }
        } else {
            CredentialState::Active
        };
        let mut guard = self.state.lock().await;
        if !guard.order.contains(&id) {
            guard.order.push(id);
        }
        guard.slots.insert(
            id,
            Slot {
                manager,
                state,
                use_count: 0,
                last_used: None,
                consecutive_transient: 0,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    pub async fn remove(&self, id: CredentialId) -> bool {
        let mut guard = self.state.lock().await;
        guard.order.retain(|item| *item != id);
        if guard.cursor >= guard.order.len() {
            guard.cursor = 0;
        }
        guard.slots.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn active_count(&self) -> usize {
        let now = Instant::now();
        let guard = self.state.lock().await;
        guard
            .order
            .iter()
            .filter(|id| guard.selectable(**id, now))
            .count()
    }

    /// Picks the sticky credential if it is usable, otherwise the next one in rotation.
    /// Never waits: either a credential is available now or the pool is exhausted.
    pub async fn acquire(
        &self,
        sticky: Option<CredentialId>,
    ) -> Result<CredentialHandle, PoolExhausted> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let total = guard.order.len();
        let Some(id) = guard.select(sticky, now) else {
            warn!(event = "pool_exhausted", phase = "acquire", total);
            return Err(PoolExhausted { total });
        };
        guard.recover(id, now);
        let Some(slot) = guard.slots.get_mut(&id) else {
            return Err(PoolExhausted { total });
        };
        slot.use_count += 1;
        slot.last_used = Some(SystemTime::now());
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(CredentialHandle {
            id,
            manager: slot.manager.clone(),
            sticky: sticky == Some(id),
            issued: None,
            in_flight: slot.in_flight.clone(),
        })
    }

    /// Records the outcome of one use and releases the handle.
    pub async fn report(&self, handle: CredentialHandle, outcome: Outcome) {
        let id = handle.id;
        match outcome {
            Outcome::Success => {
                if let Some(slot) = self.state.lock().await.slots.get_mut(&id) {
                    slot.consecutive_transient = 0;
                }
            }
            Outcome::Released => {}
            Outcome::Transient => {
                let trip = {
                    let mut guard = self.state.lock().await;
                    match guard.slots.get_mut(&id) {
                        Some(slot) => {
                            slot.consecutive_transient += 1;
                            let trip = slot.consecutive_transient >= self.policy.transient_threshold;
                            if trip {
                                slot.consecutive_transient = 0;
                            }
                            trip
                        }
                        None => false,
                    }
                };
                if trip {
                    self.mark_unavailable(
                        id,
                        self.policy.transient_cooldown,
                        UnavailableReason::Transient,
                    )
                    .await;
                }
            }
            Outcome::AuthFailure => {
                if let Some(stale) = handle.issued.as_deref() {
                    handle.manager.invalidate(stale);
                }
                self.mark_unavailable(id, self.policy.auth_cooldown, UnavailableReason::AuthInvalid)
                    .await;
            }
            Outcome::QuotaExceeded { retry_after } => {
                self.mark_unavailable(
                    id,
                    retry_after.unwrap_or(self.policy.quota_cooldown),
                    UnavailableReason::QuotaExceeded,
                )
                .await;
            }
            Outcome::Revoked(reason) => {
                self.disable(id, reason).await;
            }
        }
    }

    pub async fn mark_unavailable(
        &self,
        credential_id: CredentialId,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let until = Instant::now() + duration;
        {
            let mut guard = self.state.lock().await;
            let Some(slot) = guard.slots.get_mut(&credential_id) else {
                return;
            };
            if matches!(slot.state, CredentialState::Disabled { .. }) {
                return;
            }
            slot.state = CredentialState::Unavailable { until, reason };
        }
        self.queue.push(until, credential_id).await;

        warn!(
            event = "credential_unavailable",
            credential = credential_id,
            reason = reason.as_str(),
            cooldown_secs = duration.as_secs(),
        );
        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::UnavailableStart(UnavailableStartEvent {
                at: SystemTime::now(),
                credential_id,
                reason,
                until: until_wall,
            }))
            .await;
    }

    pub async fn disable(&self, credential_id: CredentialId, reason: String) {
        {
            let mut guard = self.state.lock().await;
            let Some(slot) = guard.slots.get_mut(&credential_id) else {
                return;
            };
            slot.state = CredentialState::Disabled {
                reason: reason.clone(),
            };
        }
        warn!(
            event = "credential_disabled",
            credential = credential_id,
            reason = %reason,
        );
        self.events
            .emit(Event::CredentialDisabled(CredentialDisabledEvent {
                at: SystemTime::now(),
                credential_id,
                reason,
            }))
            .await;
    }

    /// Puts a credential back into rotation immediately.
    pub async fn enable(&self, credential_id: CredentialId) -> bool {
        let mut guard = self.state.lock().await;
        let Some(slot) = guard.slots.get_mut(&credential_id) else {
            return false;
        };
        if slot.manager.is_disabled() {
            return false;
        }
        slot.state = CredentialState::Active;
        info!(event = "credential_enabled", credential = credential_id);
        true
    }

    pub async fn state(&self, credential_id: CredentialId) -> Option<CredentialState> {
        self.state
            .lock()
            .await
            .slots
            .get(&credential_id)
            .map(|slot| slot.state.clone())
    }

    pub async fn manager(&self, credential_id: CredentialId) -> Option<Arc<AuthManager>> {
        self.state
            .lock()
            .await
            .slots
            .get(&credential_id)
            .map(|slot| slot.manager.clone())
    }

    /// Managers in rotation order.
    pub async fn managers(&self) -> Vec<Arc<AuthManager>> {
        let guard = self.state.lock().await;
        guard
            .order
            .iter()
            .filter_map(|id| guard.slots.get(id).map(|slot| slot.manager.clone()))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<CredentialView> {
        let guard = self.state.lock().await;
        guard
            .order
            .iter()
            .filter_map(|id| guard.slots.get(id).map(|slot| (id, slot)))
            .map(|(id, slot)| {
                let credential = slot.manager.credential();
                let reason = match &slot.state {
                    CredentialState::Active => None,
                    CredentialState::Unavailable { reason, .. } => Some(reason.as_str().to_string()),
                    CredentialState::Disabled { reason } => Some(reason.clone()),
                };
                CredentialView {
                    id: *id,
                    method: credential.auth.kind(),
                    region: slot.manager.region(),
                    state: slot.state.label(),
                    reason,
                    use_count: slot.use_count,
                    last_used: slot.last_used,
                    in_flight: slot.in_flight.load(Ordering::Acquire),
                }
            })
            .collect()
    }
}
