use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use kgate_provider_core::CredentialId;
use serde::Serialize;
use tracing::info;

/// One completed request, as billed to a client key's user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub user: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub credential_id: CredentialId,
    pub at: SystemTime,
}

/// Write-only destination for usage records. Must not block.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

pub type SharedUsageSink = Arc<dyn UsageSink>;

#[derive(Debug, Default)]
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _record: UsageRecord) {}
}

/// Logs each record; the default when no store is wired in.
#[derive(Debug, Default)]
pub struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn record(&self, record: UsageRecord) {
        info!(
            event = "usage_recorded",
            user = %record.user,
            model = %record.model,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            credential = record.credential_id,
        );
    }
}

#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl UsageSink for MemoryUsageSink {
    fn record(&self, record: UsageRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
