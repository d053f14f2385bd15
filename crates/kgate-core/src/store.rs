//! Collaborator stores the pipeline reads from and writes back to.
//!
//! Runtime reads never hit a store: credentials and mappings are loaded at
//! bootstrap into the pool and resolver. Stores only see writes when a
//! credential changes (token refresh, disable).

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kgate_provider_core::{
    Credential, CredentialId, CredentialPool, CredentialStatus, Event, EventSink, ModelMappings,
};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error at {path}: {message}")]
    Io { path: String, message: String },
    #[error("store data is invalid: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credentials(&self) -> StoreResult<Vec<Credential>>;
    async fn save_credential(&self, credential: &Credential) -> StoreResult<()>;
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn load_mappings(&self) -> StoreResult<ModelMappings>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: RwLock<BTreeMap<CredentialId, Credential>>,
    mappings: RwLock<ModelMappings>,
}

impl MemoryStore {
    pub fn new(credentials: Vec<Credential>, mappings: ModelMappings) -> Self {
        Self {
            credentials: RwLock::new(
                credentials
                    .into_iter()
                    .map(|credential| (credential.id, credential))
                    .collect(),
            ),
            mappings: RwLock::new(mappings),
        }
    }

    pub async fn credential(&self, id: CredentialId) -> Option<Credential> {
        self.credentials.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_credentials(&self) -> StoreResult<Vec<Credential>> {
        Ok(self.credentials.read().await.values().cloned().collect())
    }

    async fn save_credential(&self, credential: &Credential) -> StoreResult<()> {
        self.credentials
            .write()
            .await
            .insert(credential.id, credential.clone());
        Ok(())
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn load_mappings(&self) -> StoreResult<ModelMappings> {
        Ok(self.mappings.read().await.clone())
    }
}

/// Credentials as one JSON array on disk, rewritten atomically on every save.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cache: RwLock<BTreeMap<CredentialId, Credential>>,
}

impl FileCredentialStore {
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let cache = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<Credential>>(&bytes)
                .map_err(|err| StoreError::Invalid(err.to_string()))?
                .into_iter()
                .map(|credential| (credential.id, credential))
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    message: err.to_string(),
                });
            }
        };
        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    fn io_error(&self, err: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_credentials(&self) -> StoreResult<Vec<Credential>> {
        Ok(self.cache.read().await.values().cloned().collect())
    }

    async fn save_credential(&self, credential: &Credential) -> StoreResult<()> {
        let mut cache = self.cache.write().await;
        cache.insert(credential.id, credential.clone());
        let all: Vec<&Credential> = cache.values().collect();
        let bytes = serde_json::to_vec_pretty(&all)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|err| self.io_error(err))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        Ok(())
    }
}

/// Overlays stored credentials onto configured ones, by id.
pub fn merge_credentials(configured: Vec<Credential>, stored: Vec<Credential>) -> Vec<Credential> {
    let mut merged: BTreeMap<CredentialId, Credential> = configured
        .into_iter()
        .map(|credential| (credential.id, credential))
        .collect();
    for credential in stored {
        if let Some(existing) = merged.get_mut(&credential.id) {
            // Configured secrets win unless the stored record rotated them.
            *existing = Credential {
                status: if credential.status == CredentialStatus::Disabled {
                    CredentialStatus::Disabled
                } else {
                    existing.status
                },
                ..credential
            };
        }
    }
    merged.into_values().collect()
}

/// Writes credential changes announced on the event hub back to a store.
pub struct CredentialPersistSink {
    pool: Weak<CredentialPool>,
    store: Arc<dyn CredentialStore>,
}

impl CredentialPersistSink {
    pub fn new(pool: &Arc<CredentialPool>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            pool: Arc::downgrade(pool),
            store,
        }
    }
}

impl EventSink for CredentialPersistSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if !matches!(event, Event::TokenRefreshed(_) | Event::CredentialDisabled(_)) {
                return;
            }
            let Some(pool) = self.pool.upgrade() else {
                return;
            };
            let Some(manager) = pool.manager(event.credential_id()).await else {
                return;
            };
            let credential = manager.credential();
            if let Err(err) = self.store.save_credential(&credential).await {
                warn!(
                    event = "credential_persist_failed",
                    credential = credential.id,
                    error = %err,
                );
            }
        })
    }
}
