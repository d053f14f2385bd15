use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use kgate_provider_core::PoolExhausted;
use kgate_transform::ValidationError;
use kgate_transform::conversation::ClientProtocol;
use kgate_transform::response::claude::claude_error;
use kgate_transform::response::openai::openai_error;

/// Everything a request can fail with once it reaches the pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("missing or invalid api key")]
    InvalidApiKey,
    #[error("api key is disabled")]
    AccountDisabled,
    /// Account-level allowance; never failed over.
    #[error("allowance exhausted: {0}")]
    AllowanceExhausted(String),
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),
    #[error("upstream unavailable after {attempts} attempt(s): {message}")]
    UpstreamTransient { attempts: usize, message: String },
    /// The upstream refused the request itself; its status is passed through.
    #[error("upstream rejected the request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::InvalidApiKey => "invalid_api_key",
            PipelineError::AccountDisabled => "account_disabled",
            PipelineError::AllowanceExhausted(_) => "quota_error",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::PoolExhausted(err) => err.code(),
            PipelineError::UpstreamTransient { .. } => "upstream_transient_error",
            PipelineError::UpstreamRejected { .. } => "upstream_error",
            PipelineError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            PipelineError::AccountDisabled | PipelineError::AllowanceExhausted(_) => {
                StatusCode::FORBIDDEN
            }
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::UpstreamTransient { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// JSON error body in the caller's protocol.
    pub fn body(&self, protocol: ClientProtocol) -> Bytes {
        let message = self.to_string();
        let encoded = match protocol {
            ClientProtocol::OpenAIChat => serde_json::to_vec(&openai_error(self.code(), &message)),
            ClientProtocol::AnthropicMessages => {
                serde_json::to_vec(&claude_error(self.code(), &message))
            }
        };
        match encoded {
            Ok(body) => Bytes::from(body),
            Err(_) => Bytes::from(format!("{{\"error\":{{\"message\":\"{}\"}}}}", self.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (
                PipelineError::Validation(ValidationError::EmptyModel),
                422,
                "validation_error",
            ),
            (PipelineError::InvalidApiKey, 401, "invalid_api_key"),
            (PipelineError::AccountDisabled, 403, "account_disabled"),
            (
                PipelineError::AllowanceExhausted("monthly".to_string()),
                403,
                "quota_error",
            ),
            (
                PipelineError::RateLimited {
                    message: "slow down".to_string(),
                    retry_after: None,
                },
                429,
                "rate_limited",
            ),
            (
                PipelineError::PoolExhausted(PoolExhausted { total: 3 }),
                503,
                "pool_exhausted",
            ),
            (
                PipelineError::UpstreamTransient {
                    attempts: 2,
                    message: "reset".to_string(),
                },
                502,
                "upstream_transient_error",
            ),
            (
                PipelineError::UpstreamRejected {
                    status: 400,
                    message: "Input is too long".to_string(),
                },
                400,
                "upstream_error",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn bodies_follow_the_caller_protocol() {
        let err = PipelineError::PoolExhausted(PoolExhausted { total: 3 });

        let openai: serde_json::Value =
            serde_json::from_slice(&err.body(ClientProtocol::OpenAIChat)).unwrap();
        assert_eq!(openai["error"]["code"], "pool_exhausted");
        assert_eq!(openai["error"]["type"], "pool_exhausted");

        let claude: serde_json::Value =
            serde_json::from_slice(&err.body(ClientProtocol::AnthropicMessages)).unwrap();
        assert_eq!(claude["type"], "error");
        assert_eq!(claude["error"]["type"], "overloaded_error");
    }
}
