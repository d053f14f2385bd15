use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::AuthMethod;

/// Default token lifetime when the token service omits `expiresIn`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Performs one refresh call for a credential's auth method.
///
/// Implementations dispatch on the method tag (`AuthMethod::refresh_url` and
/// `AuthMethod::refresh_body` describe the request) and classify the outcome.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, method: &AuthMethod, region: &str)
    -> Result<TokenGrant, ExchangeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Seconds from now.
    pub expires_in: i64,
    pub profile_arn: Option<String>,
}

impl TokenGrant {
    /// Reads the camelCase body both token services return.
    pub fn from_json(value: &JsonValue) -> Result<Self, ExchangeError> {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let access_token = text("accessToken").ok_or_else(|| {
            ExchangeError::Malformed("token response missing accessToken".to_string())
        })?;
        Ok(Self {
            access_token,
            refresh_token: text("refreshToken"),
            expires_in: value
                .get("expiresIn")
                .and_then(JsonValue::as_i64)
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_EXPIRES_IN),
            profile_arn: text("profileArn"),
        })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// Connect/read failure; no response.
    #[error("transport: {0}")]
    Transport(String),
    /// The service answered with an error status that says nothing about the credential.
    #[error("status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// `invalid_grant`, revoked client, or 401/403 from the token service.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Maps a token-service error response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let lowered = body.to_ascii_lowercase();
        if status == 401
            || status == 403
            || lowered.contains("invalid_grant")
            || lowered.contains("invalid_client")
            || lowered.contains("unauthorized_client")
        {
            return ExchangeError::InvalidCredential(format!("status {status}: {body}"));
        }
        ExchangeError::Rejected {
            status,
            message: body.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Transport(_) => true,
            ExchangeError::Rejected { status, .. } => *status == 429 || *status >= 500,
            ExchangeError::InvalidCredential(_) | ExchangeError::Malformed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn grant_defaults_lifetime_and_keeps_rotation() {
        let grant = TokenGrant::from_json(&json!({
            "accessToken": "a",
            "refreshToken": "r2",
        }))
        .unwrap();
        assert_eq!(grant.expires_in, DEFAULT_EXPIRES_IN);
        assert_eq!(grant.refresh_token.as_deref(), Some("r2"));
        assert!(matches!(
            TokenGrant::from_json(&json!({"expiresIn": 10})),
            Err(ExchangeError::Malformed(_))
        ));
    }

    #[test]
    fn invalid_grant_is_terminal_and_5xx_retryable() {
        let err = ExchangeError::from_status(400, r#"{"error":"invalid_grant"}"#);
        assert!(matches!(err, ExchangeError::InvalidCredential(_)));
        assert!(!err.is_retryable());
        assert!(ExchangeError::from_status(503, "busy").is_retryable());
        assert!(!ExchangeError::from_status(400, "bad").is_retryable());
    }
}
