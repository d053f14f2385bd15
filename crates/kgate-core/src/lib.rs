pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod store;
pub mod truncation;
pub mod upstream;
pub mod usage;

pub use auth::{ClientAuthenticator, ClientIdentity, KeySnapshot, MemoryClientKeys, OpenAccess};
pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env};
pub use config::{ClientKeyConfig, ConfigError, GatewayConfig};
pub use error::PipelineError;
pub use metadata::MetadataRefresher;
pub use orchestrator::{GatewayReply, GatewayRequest, Orchestrator, OrchestratorSettings, Surface};
pub use truncation::{TruncationConfig, TruncationLedger};
pub use upstream::{Upstream, UpstreamCall, UpstreamError, UpstreamSettings, UpstreamStream};
pub use usage::{MemoryUsageSink, SharedUsageSink, UsageRecord, UsageSink};
