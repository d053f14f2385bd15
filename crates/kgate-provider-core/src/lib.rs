pub mod auth;
pub mod credential;
pub mod errors;
pub mod events;
pub mod pool;
pub mod resolver;

pub use auth::{
    AuthManager, AuthSession, ExchangeError, RefreshPolicy, TokenExchange, TokenGrant,
};
pub use credential::{
    AuthMethod, Credential, CredentialId, CredentialState, CredentialStatus, UnavailableReason,
};
pub use errors::{AuthError, PoolExhausted};
pub use events::{Event, EventHub, EventSink, TerminalEventSink};
pub use pool::{CredentialHandle, CredentialPool, CredentialView, Outcome, PoolPolicy};
pub use resolver::{MatchedRule, ModelCatalog, ModelMappings, ModelResolver, Resolution};
