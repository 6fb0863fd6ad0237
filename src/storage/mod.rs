//! Storage façade and backend adapters.
//!
//! The rest of the crate only talks to [`EvidenceStorage`]. It wraps exactly
//! one [`StorageBackend`] adapter, chosen at startup:
//!
//! | adapter | medium | WORM | legal hold | retention |
//! |---------|--------|------|------------|-----------|
//! | [`ObjectLockBackend`] | locked-retention object store | yes | yes | enforced |
//! | [`ImmutableBlobBackend`] | immutable-policy blob store | yes | yes | enforced |
//! | [`RelationalBackend`] | SQLite, development only | no | metadata | metadata |
//! | [`ArchiveBackend`] | low-cost object store | no | no | bookkeeping |
//!
//! Every adapter rejects writes to an existing key before touching the
//! medium, whatever the medium's native overwrite behaviour is.

pub mod archive;
pub mod blob;
pub mod error_map;
pub mod facade;
pub mod object_lock;
pub mod relational;
pub mod types;

pub use archive::{ArchiveBackend, ArchiveClient, ArchiveRecord, FsArchiveClient};
pub use blob::{
    BlobContainerClient, BlobProperties, ImmutabilityPolicy, ImmutableBlobBackend,
    InMemoryBlobContainer, PolicyMode, UploadOptions,
};
pub use error_map::NativeError;
pub use facade::EvidenceStorage;
pub use object_lock::{
    HeadObjectOutput, InMemoryObjectLockClient, ObjectLockBackend, ObjectLockClient,
    PutObjectOutput, PutObjectRequest,
};
pub use relational::RelationalBackend;
pub use types::{
    NewObject, ObjectMetadata, RetrievedObject, StorageCapabilities, StoreOptions, StoredObject,
    DEFAULT_LIST_LIMIT,
};

use crate::config::{BackendKind, VaultConfig};
use crate::error::{Result, StorageResult, VaultError};
use crate::retention::AppliedRetention;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

/// Capability contract every physical medium implements.
///
/// Adapters map native failures through [`error_map`] and never let a native
/// type escape.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Static declaration of what this backend guarantees.
    fn capabilities(&self) -> StorageCapabilities;

    /// Writes a new object. Fails `AlreadyExists` if the key is present.
    async fn put(&self, object: NewObject) -> StorageResult<StoredObject>;

    /// Reads bytes and metadata.
    async fn get(&self, key: &str) -> StorageResult<(Bytes, ObjectMetadata)>;

    /// Reads metadata only.
    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Keys under `prefix`, lexicographically ordered, at most `limit`.
    async fn list(&self, prefix: &str, limit: usize) -> StorageResult<Vec<String>>;

    async fn set_legal_hold(&self, key: &str, on: bool) -> StorageResult<()>;

    /// Replaces the retention on an object after consulting the policy engine.
    async fn set_retention(
        &self,
        key: &str,
        retention: AppliedRetention,
        bypass_governance: bool,
    ) -> StorageResult<()>;

    /// Removes an object. The façade has already consulted the policy engine.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Cheap reachability probe.
    async fn ping(&self) -> StorageResult<()>;
}

/// Builds the configured backend.
///
/// Relational and archive backends are opened straight from configuration.
/// The object-lock and blob media need a client constructed by the host
/// (credentials and transport are its concern) and injected here.
#[derive(Default)]
pub struct StorageBuilder {
    object_lock_client: Option<Arc<dyn ObjectLockClient>>,
    blob_client: Option<Arc<dyn BlobContainerClient>>,
    archive_client: Option<Arc<dyn ArchiveClient>>,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_lock_client(mut self, client: Arc<dyn ObjectLockClient>) -> Self {
        self.object_lock_client = Some(client);
        self
    }

    pub fn blob_client(mut self, client: Arc<dyn BlobContainerClient>) -> Self {
        self.blob_client = Some(client);
        self
    }

    pub fn archive_client(mut self, client: Arc<dyn ArchiveClient>) -> Self {
        self.archive_client = Some(client);
        self
    }

    /// Opens the backend selected by `config.storage.backend` and wraps it
    /// in the façade.
    pub async fn build(self, config: &VaultConfig) -> Result<EvidenceStorage> {
        let storage = &config.storage;
        let backend: Arc<dyn StorageBackend> = match storage.backend {
            BackendKind::ObjectLock => {
                let client = self.object_lock_client.ok_or_else(|| {
                    VaultError::Config("object-lock backend selected but no client was provided".into())
                })?;
                let bucket = required(&storage.bucket, "storage.bucket")?;
                Arc::new(ObjectLockBackend::new(client, bucket, config.retention.lock_mode))
            }
            BackendKind::ImmutableBlob => {
                let client = self.blob_client.ok_or_else(|| {
                    VaultError::Config("immutable-blob backend selected but no client was provided".into())
                })?;
                let container = required(&storage.container, "storage.container")?;
                Arc::new(ImmutableBlobBackend::new(client, container))
            }
            BackendKind::Relational => {
                let path = storage.database_path.as_ref().ok_or_else(|| VaultError::InvalidConfig {
                    field: "storage.database_path".to_string(),
                    reason: "required for the relational backend".to_string(),
                })?;
                Arc::new(RelationalBackend::open(path).await?)
            }
            BackendKind::Archive => {
                let client: Arc<dyn ArchiveClient> = match self.archive_client {
                    Some(client) => client,
                    None => {
                        let root = storage.archive_root.as_ref().ok_or_else(|| {
                            VaultError::InvalidConfig {
                                field: "storage.archive_root".to_string(),
                                reason: "required for the archive backend".to_string(),
                            }
                        })?;
                        Arc::new(FsArchiveClient::open(root).await?)
                    }
                };
                Arc::new(ArchiveBackend::new(client))
            }
        };

        let facade = EvidenceStorage::new(backend)
            .with_key_prefix(storage.key_prefix.clone())
            .with_timeout(storage.operation_timeout);

        info!(
            backend = %storage.backend,
            provider = %facade.capabilities().provider_name,
            worm = facade.capabilities().supports_worm,
            "Storage backend ready"
        );
        Ok(facade)
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| VaultError::InvalidConfig {
            field: field.to_string(),
            reason: "required for the selected backend".to_string(),
        })
}
