use crate::CredentialId;

/// Failure to obtain a bearer token for one credential.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// The token endpoint rejected the credential itself. Terminal.
    #[error("credential {credential_id} disabled: {reason}")]
    Disabled {
        credential_id: CredentialId,
        reason: String,
    },
    /// Refresh kept failing after the retry budget was spent.
    #[error("token refresh for credential {credential_id} failed: {message}")]
    RefreshFailed {
        credential_id: CredentialId,
        message: String,
    },
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Disabled { .. } => "auth_error",
            AuthError::RefreshFailed { .. } => "upstream_transient_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::Disabled { .. })
    }

    pub fn credential_id(&self) -> CredentialId {
        match self {
            AuthError::Disabled { credential_id, .. }
            | AuthError::RefreshFailed { credential_id, .. } => *credential_id,
        }
    }
}

/// No credential in the pool can serve a request right now.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("no upstream credential available ({total} configured)")]
pub struct PoolExhausted {
    pub total: usize,
}

impl PoolExhausted {
    pub fn code(&self) -> &'static str {
        "pool_exhausted"
    }
}
