mod recovery_queue;
mod state;

pub(crate) use recovery_queue::RecoveryQueue;
pub use state::{CredentialId, CredentialState, UnavailableReason};

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// One upstream account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    #[serde(flatten)]
    pub auth: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(
        default,
        alias = "profileArn",
        skip_serializing_if = "Option::is_none"
    )]
    pub profile_arn: Option<String>,
    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(
        default,
        alias = "accessToken",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_token: Option<String>,
    /// Unix seconds.
    #[serde(
        default,
        alias = "expiresAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<i64>,
}

impl Credential {
    pub fn region_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.region
            .as_deref()
            .filter(|region| !region.trim().is_empty())
            .unwrap_or(fallback)
    }

    pub fn is_disabled(&self) -> bool {
        self.status == CredentialStatus::Disabled
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    #[default]
    Active,
    Disabled,
}

/// How a credential obtains its bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Desktop sign-in: a long-lived refresh token exchanged at the Kiro auth service.
    RefreshToken {
        #[serde(alias = "refreshToken")]
        refresh_token: String,
    },
    /// IAM Identity Center: registered OIDC client plus refresh token.
    ClientCredentials {
        #[serde(alias = "clientId")]
        client_id: String,
        #[serde(alias = "clientSecret")]
        client_secret: String,
        #[serde(alias = "refreshToken")]
        refresh_token: String,
    },
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::RefreshToken { .. } => "refresh_token",
            AuthMethod::ClientCredentials { .. } => "client_credentials",
        }
    }

    pub fn refresh_token(&self) -> &str {
        match self {
            AuthMethod::RefreshToken { refresh_token }
            | AuthMethod::ClientCredentials { refresh_token, .. } => refresh_token,
        }
    }

    pub fn refresh_url(&self, region: &str) -> String {
        match self {
            AuthMethod::RefreshToken { .. } => {
                format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
            }
            AuthMethod::ClientCredentials { .. } => {
                format!("https://oidc.{region}.amazonaws.com/token")
            }
        }
    }

    pub fn refresh_body(&self) -> JsonValue {
        match self {
            AuthMethod::RefreshToken { refresh_token } => json!({
                "refreshToken": refresh_token,
            }),
            AuthMethod::ClientCredentials {
                client_id,
                client_secret,
                refresh_token,
            } => json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "grantType": "refresh_token",
                "refreshToken": refresh_token,
            }),
        }
    }

    /// Both services may rotate the refresh token on every exchange.
    pub fn rotate(&mut self, next: String) {
        match self {
            AuthMethod::RefreshToken { refresh_token }
            | AuthMethod::ClientCredentials { refresh_token, .. } => *refresh_token = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_flows_from_config_shape() {
        let social: Credential = serde_json::from_value(json!({
            "id": 1,
            "method": "refresh_token",
            "refreshToken": "r1",
            "profileArn": "arn:aws:codewhisperer:us-east-1:1:profile/X"
        }))
        .unwrap();
        assert_eq!(social.auth.kind(), "refresh_token");
        assert_eq!(social.status, CredentialStatus::Active);
        assert_eq!(social.region_or("us-east-1"), "us-east-1");

        let idc: Credential = serde_json::from_value(json!({
            "id": 2,
            "method": "client_credentials",
            "client_id": "c",
            "client_secret": "s",
            "refresh_token": "r2",
            "region": "eu-west-1",
            "status": "disabled"
        }))
        .unwrap();
        assert!(idc.is_disabled());
        assert_eq!(
            idc.auth.refresh_url(idc.region_or("us-east-1")),
            "https://oidc.eu-west-1.amazonaws.com/token"
        );
        assert_eq!(idc.auth.refresh_body()["grantType"], "refresh_token");
    }

    #[test]
    fn rotate_replaces_refresh_token() {
        let mut method = AuthMethod::ClientCredentials {
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
            refresh_token: "old".to_string(),
        };
        method.rotate("new".to_string());
        assert_eq!(method.refresh_token(), "new");
    }
}
