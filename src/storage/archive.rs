//! Low-cost archive object store without lock support.
//!
//! Retention parameters are kept as bookkeeping next to the object and are
//! never enforced. Legal hold is refused with `NOT_SUPPORTED`. Meant for
//! non-regulated archival only.

use super::error_map::NativeError;
use super::types::{NewObject, ObjectMetadata, StorageCapabilities, StoredObject};
use super::StorageBackend;
use crate::error::{Result, StorageError, StorageResult};
use crate::retention::{self, AppliedRetention};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const MAX_ARCHIVE_OBJECT: u64 = 5 * 1024 * 1024 * 1024 * 1024;

/// Sidecar record stored next to each archived object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub content_hash: String,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Bookkeeping only.
    pub retention: Option<AppliedRetention>,
}

/// Object operations of the archive medium.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Creates an object. The medium itself refuses to overwrite.
    async fn put_object(&self, key: &str, body: Bytes, record: ArchiveRecord)
        -> std::result::Result<(), NativeError>;

    async fn get_object(&self, key: &str) -> std::result::Result<(Bytes, ArchiveRecord), NativeError>;

    async fn head_object(&self, key: &str) -> std::result::Result<ArchiveRecord, NativeError>;

    async fn update_record(&self, key: &str, record: ArchiveRecord)
        -> std::result::Result<(), NativeError>;

    /// Keys under `prefix` in lexicographic order, at most `max_keys`.
    async fn list_objects(&self, prefix: &str, max_keys: usize)
        -> std::result::Result<Vec<String>, NativeError>;

    async fn delete_object(&self, key: &str) -> std::result::Result<(), NativeError>;

    async fn ping(&self) -> std::result::Result<(), NativeError>;
}

/// Archive client over a local directory tree.
///
/// Layout: `<root>/objects/<name>` holds the bytes, `<root>/meta/<name>.json`
/// the sidecar record. `<name>` is the percent-encoded key, so every key is a
/// single file and no key can be a directory of another.
pub struct FsArchiveClient {
    root: PathBuf,
}

impl FsArchiveClient {
    pub async fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("objects")).await?;
        fs::create_dir_all(root.join("meta")).await?;
        info!(root = %root.display(), "Opened archive store");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Location of an object's bytes on disk.
    pub fn object_path(&self, key: &str) -> std::result::Result<PathBuf, NativeError> {
        Ok(self.root.join("objects").join(file_name(key)?))
    }

    fn record_path(&self, key: &str) -> std::result::Result<PathBuf, NativeError> {
        Ok(self.root.join("meta").join(format!("{}.json", file_name(key)?)))
    }

    async fn write_record(&self, key: &str, record: &ArchiveRecord) -> std::result::Result<(), NativeError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| NativeError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(self.record_path(key)?, json).await?;
        Ok(())
    }
}

/// Validates a key as a relative path that stays inside the root and maps
/// it to its on-disk file name.
fn file_name(key: &str) -> std::result::Result<String, NativeError> {
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if key.is_empty() || escapes {
        return Err(NativeError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("key '{}' escapes the archive root", key),
        )));
    }
    Ok(urlencoding::encode(key).into_owned())
}

#[async_trait]
impl ArchiveClient for FsArchiveClient {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        record: ArchiveRecord,
    ) -> std::result::Result<(), NativeError> {
        let path = self.object_path(key)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        self.write_record(key, &record).await
    }

    async fn get_object(&self, key: &str) -> std::result::Result<(Bytes, ArchiveRecord), NativeError> {
        let body = fs::read(self.object_path(key)?).await?;
        let record = self.head_object(key).await?;
        Ok((Bytes::from(body), record))
    }

    async fn head_object(&self, key: &str) -> std::result::Result<ArchiveRecord, NativeError> {
        let raw = fs::read(self.record_path(key)?).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| NativeError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    async fn update_record(&self, key: &str, record: ArchiveRecord) -> std::result::Result<(), NativeError> {
        // Must exist first.
        fs::metadata(self.object_path(key)?).await?;
        self.write_record(key, &record).await
    }

    async fn list_objects(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> std::result::Result<Vec<String>, NativeError> {
        let mut entries = fs::read_dir(self.root.join("objects")).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name
                .to_str()
                .and_then(|n| urlencoding::decode(n).ok())
                .map(|k| k.into_owned())
            else {
                debug!(file = ?name, "Skipping foreign file in archive");
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        keys.sort();
        keys.truncate(max_keys);
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> std::result::Result<(), NativeError> {
        fs::remove_file(self.object_path(key)?).await?;
        match fs::remove_file(self.record_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> std::result::Result<(), NativeError> {
        fs::metadata(self.root.join("objects")).await?;
        Ok(())
    }
}

/// Adapter for the archive medium.
pub struct ArchiveBackend {
    client: Arc<dyn ArchiveClient>,
}

impl ArchiveBackend {
    pub fn new(client: Arc<dyn ArchiveClient>) -> Self {
        Self { client }
    }

    fn to_metadata(key: &str, record: ArchiveRecord) -> ObjectMetadata {
        let mut provider_metadata = HashMap::new();
        provider_metadata.insert("retention_enforced".to_string(), "false".to_string());
        ObjectMetadata {
            key: key.to_string(),
            content_hash: Some(record.content_hash),
            size: record.size,
            stored_at: record.stored_at,
            retention: record.retention,
            legal_hold: false,
            content_type: record.content_type,
            metadata: record.metadata,
            provider_metadata,
        }
    }
}

#[async_trait]
impl StorageBackend for ArchiveBackend {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            supports_worm: false,
            supports_legal_hold: false,
            supports_retention: false,
            max_object_size: MAX_ARCHIVE_OBJECT,
            provider_name: "archive".to_string(),
        }
    }

    async fn put(&self, object: NewObject) -> StorageResult<StoredObject> {
        if self.exists(&object.key).await? {
            return Err(StorageError::AlreadyExists(object.key));
        }

        let record = ArchiveRecord {
            content_hash: object.content_hash.clone(),
            size: object.size(),
            stored_at: object.stored_at,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
            retention: object.retention,
        };
        self.client
            .put_object(&object.key, object.data.clone(), record)
            .await
            .map_err(|e| e.into_storage(&format!("archive put {}", object.key)))?;

        debug!(key = %object.key, "Archived object");
        let mut provider = HashMap::new();
        provider.insert("retention_enforced".to_string(), "false".to_string());
        Ok(object.into_stored(provider))
    }

    async fn get(&self, key: &str) -> StorageResult<(Bytes, ObjectMetadata)> {
        let (body, record) = self
            .client
            .get_object(key)
            .await
            .map_err(|e| e.into_storage(&format!("archive get {}", key)))?;
        Ok((body, Self::to_metadata(key, record)))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let record = self
            .client
            .head_object(key)
            .await
            .map_err(|e| e.into_storage(&format!("archive head {}", key)))?;
        Ok(Self::to_metadata(key, record))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.client.head_object(key).await {
            Ok(_) => Ok(true),
            Err(e) => match e.into_storage(&format!("archive head {}", key)) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> StorageResult<Vec<String>> {
        self.client
            .list_objects(prefix, limit)
            .await
            .map_err(|e| e.into_storage(&format!("archive list {}", prefix)))
    }

    async fn set_legal_hold(&self, key: &str, _on: bool) -> StorageResult<()> {
        Err(NativeError::Capability("archive store has no legal hold".to_string())
            .into_storage(&format!("legal hold {}", key)))
    }

    async fn set_retention(
        &self,
        key: &str,
        requested: AppliedRetention,
        bypass_governance: bool,
    ) -> StorageResult<()> {
        let mut record = self
            .client
            .head_object(key)
            .await
            .map_err(|e| e.into_storage(&format!("archive head {}", key)))?;
        retention::validate_change(record.retention.as_ref(), &requested, bypass_governance)?;
        record.retention = Some(requested);
        self.client
            .update_record(key, record)
            .await
            .map_err(|e| e.into_storage(&format!("archive retention {}", key)))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object(key)
            .await
            .map_err(|e| e.into_storage(&format!("archive delete {}", key)))
    }

    async fn ping(&self) -> StorageResult<()> {
        self.client
            .ping()
            .await
            .map_err(|e| e.into_storage("archive ping"))
    }
}
