use tokio::time::Instant;

use serde::{Deserialize, Serialize};

pub type CredentialId = i64;

/// Selection state as seen by the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialState {
    Active,
    Unavailable {
        until: Instant,
        reason: UnavailableReason,
    },
    Disabled {
        reason: String,
    },
}

impl CredentialState {
    /// Unavailable entries whose deadline passed count as active even if the
    /// recovery task has not caught up yet.
    pub fn is_selectable(&self, now: Instant) -> bool {
        match self {
            CredentialState::Active => true,
            CredentialState::Unavailable { until, .. } => *until <= now,
            CredentialState::Disabled { .. } => false,
        }
    }

    pub fn unavailable_until(&self) -> Option<Instant> {
        match self {
            CredentialState::Unavailable { until, .. } => Some(*until),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::Active => "active",
            CredentialState::Unavailable { .. } => "unavailable",
            CredentialState::Disabled { .. } => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    AuthInvalid,
    QuotaExceeded,
    Transient,
    Manual,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::AuthInvalid => "auth_invalid",
            UnavailableReason::QuotaExceeded => "quota_exceeded",
            UnavailableReason::Transient => "transient",
            UnavailableReason::Manual => "manual",
        }
    }
}
