use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{CredentialId, UnavailableReason};

/// Operational events about credential health.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    UnavailableStart(UnavailableStartEvent),
    UnavailableEnd(UnavailableEndEvent),
    CredentialDisabled(CredentialDisabledEvent),
    TokenRefreshed(TokenRefreshedEvent),
}

impl Event {
    pub fn credential_id(&self) -> CredentialId {
        match self {
            Event::UnavailableStart(ev) => ev.credential_id,
            Event::UnavailableEnd(ev) => ev.credential_id,
            Event::CredentialDisabled(ev) => ev.credential_id,
            Event::TokenRefreshed(ev) => ev.credential_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableStartEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub reason: UnavailableReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableEndEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialDisabledEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefreshedEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    /// Unix seconds.
    pub expires_at: i64,
    /// Whether the token service issued a new refresh token.
    pub rotated: bool,
}
