//! Compliance-lock object store adapter.
//!
//! Retention is enforced by the medium itself: objects written with a lock in
//! COMPLIANCE mode cannot be shortened or deleted by anyone until they expire,
//! GOVERNANCE locks can be overridden by an authorized bypass. Legal holds are
//! independent of retention.
//!
//! The adapter speaks to the medium through [`ObjectLockClient`], the narrow
//! slice of the object-store API it needs. [`InMemoryObjectLockClient`]
//! reproduces the medium's native behaviour for development and tests,
//! including silently overwriting existing keys, which is why the adapter
//! checks for an existing key itself before every write.

use super::error_map::NativeError;
use super::types::{NewObject, ObjectMetadata, StorageCapabilities, StoredObject};
use super::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::retention::{self, AppliedRetention, RetentionMode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// User-metadata key holding the hash recorded at store time.
const META_CONTENT_HASH: &str = "content-sha256";
/// User-metadata key holding the store timestamp.
const META_STORED_AT: &str = "stored-at";

/// Single-request upload limit of the medium (5 GiB).
const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Object-store write request.
#[derive(Debug, Clone)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub lock_mode: Option<RetentionMode>,
    pub retain_until: Option<DateTime<Utc>>,
    pub legal_hold: bool,
}

/// Object-store write response.
#[derive(Debug, Clone)]
pub struct PutObjectOutput {
    pub version_id: String,
    pub etag: String,
}

/// Object-store HEAD response.
#[derive(Debug, Clone)]
pub struct HeadObjectOutput {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub last_modified: DateTime<Utc>,
    pub version_id: String,
    pub etag: String,
    pub lock_mode: Option<RetentionMode>,
    pub retain_until: Option<DateTime<Utc>>,
    pub legal_hold: bool,
}

/// The subset of the object-store API the adapter uses.
#[async_trait]
pub trait ObjectLockClient: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<(), NativeError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<HeadObjectOutput, NativeError>;

    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectOutput, NativeError>;

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(Bytes, HeadObjectOutput), NativeError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<String>, NativeError>;

    async fn put_object_retention(
        &self,
        bucket: &str,
        key: &str,
        mode: RetentionMode,
        retain_until: DateTime<Utc>,
        bypass_governance: bool,
    ) -> Result<(), NativeError>;

    async fn put_object_legal_hold(&self, bucket: &str, key: &str, on: bool)
        -> Result<(), NativeError>;

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        bypass_governance: bool,
    ) -> Result<(), NativeError>;
}

/// Adapter for the locked-retention object store.
pub struct ObjectLockBackend {
    client: Arc<dyn ObjectLockClient>,
    bucket: String,
    default_mode: RetentionMode,
}

impl ObjectLockBackend {
    /// `default_mode` is the bucket's configured lock mode, reported in
    /// provider metadata for objects stored without explicit retention.
    pub fn new(
        client: Arc<dyn ObjectLockClient>,
        bucket: impl Into<String>,
        default_mode: RetentionMode,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            default_mode,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn to_metadata(&self, key: &str, head: HeadObjectOutput) -> ObjectMetadata {
        let retention = match (head.lock_mode, head.retain_until) {
            (Some(mode), Some(retain_until)) => Some(AppliedRetention { mode, retain_until }),
            _ => None,
        };
        let stored_at = head
            .metadata
            .get(META_STORED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(head.last_modified);

        let mut metadata = head.metadata;
        let content_hash = metadata.remove(META_CONTENT_HASH);
        metadata.remove(META_STORED_AT);

        let mut provider_metadata = HashMap::new();
        provider_metadata.insert("bucket".to_string(), self.bucket.clone());
        provider_metadata.insert("version_id".to_string(), head.version_id);
        provider_metadata.insert("etag".to_string(), head.etag);

        ObjectMetadata {
            key: key.to_string(),
            content_hash,
            size: head.content_length,
            stored_at,
            retention,
            legal_hold: head.legal_hold,
            content_type: head.content_type,
            metadata,
            provider_metadata,
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectLockBackend {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            supports_worm: true,
            supports_legal_hold: true,
            supports_retention: true,
            max_object_size: MAX_OBJECT_SIZE,
            provider_name: "object-lock".to_string(),
        }
    }

    async fn put(&self, object: NewObject) -> StorageResult<StoredObject> {
        if self.exists(&object.key).await? {
            return Err(StorageError::AlreadyExists(object.key));
        }

        let mut metadata = object.metadata.clone();
        metadata.insert(META_CONTENT_HASH.to_string(), object.content_hash.clone());
        metadata.insert(
            META_STORED_AT.to_string(),
            crate::hash::canonical_timestamp(&object.stored_at),
        );

        let request = PutObjectRequest {
            bucket: self.bucket.clone(),
            key: object.key.clone(),
            body: object.data.clone(),
            content_type: object.content_type.clone(),
            metadata,
            lock_mode: object.retention.map(|r| r.mode),
            retain_until: object.retention.map(|r| r.retain_until),
            legal_hold: false,
        };

        let output = self
            .client
            .put_object(request)
            .await
            .map_err(|e| e.into_storage(&format!("put {}", object.key)))?;

        debug!(
            bucket = %self.bucket,
            key = %object.key,
            version_id = %output.version_id,
            "Stored locked object"
        );

        let mut provider = HashMap::new();
        provider.insert("bucket".to_string(), self.bucket.clone());
        provider.insert("version_id".to_string(), output.version_id);
        provider.insert("etag".to_string(), output.etag);
        provider.insert(
            "lock_mode".to_string(),
            object
                .retention
                .map(|r| r.mode)
                .unwrap_or(self.default_mode)
                .to_string(),
        );
        Ok(object.into_stored(provider))
    }

    async fn get(&self, key: &str) -> StorageResult<(Bytes, ObjectMetadata)> {
        let (body, head) = self
            .client
            .get_object(&self.bucket, key)
            .await
            .map_err(|e| e.into_storage(&format!("get {}", key)))?;
        Ok((body, self.to_metadata(key, head)))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let head = self
            .client
            .head_object(&self.bucket, key)
            .await
            .map_err(|e| e.into_storage(&format!("head {}", key)))?;
        Ok(self.to_metadata(key, head))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.client.head_object(&self.bucket, key).await {
            Ok(_) => Ok(true),
            Err(e) => match e.into_storage(&format!("head {}", key)) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> StorageResult<Vec<String>> {
        self.client
            .list_objects(&self.bucket, prefix, limit)
            .await
            .map_err(|e| e.into_storage(&format!("list {}", prefix)))
    }

    async fn set_legal_hold(&self, key: &str, on: bool) -> StorageResult<()> {
        self.client
            .put_object_legal_hold(&self.bucket, key, on)
            .await
            .map_err(|e| e.into_storage(&format!("legal hold {}", key)))?;
        info!(bucket = %self.bucket, key = %key, on, "Updated legal hold");
        Ok(())
    }

    async fn set_retention(
        &self,
        key: &str,
        requested: AppliedRetention,
        bypass_governance: bool,
    ) -> StorageResult<()> {
        let current = self.head(key).await?.retention;
        retention::validate_change(current.as_ref(), &requested, bypass_governance)?;

        self.client
            .put_object_retention(
                &self.bucket,
                key,
                requested.mode,
                requested.retain_until,
                bypass_governance,
            )
            .await
            .map_err(|e| e.into_storage(&format!("retention {}", key)))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object(&self.bucket, key, false)
            .await
            .map_err(|e| e.into_storage(&format!("delete {}", key)))
    }

    async fn ping(&self) -> StorageResult<()> {
        self.client
            .head_bucket(&self.bucket)
            .await
            .map_err(|e| e.into_storage(&format!("head bucket {}", self.bucket)))
    }
}

#[derive(Debug, Clone)]
struct SimObject {
    body: Bytes,
    head: HeadObjectOutput,
}

/// In-process stand-in for the locked-retention object store.
///
/// Behaves like the real medium: a PUT on an existing key silently creates a
/// new current version, locked retention cannot be shortened, locked or held
/// objects cannot be deleted. Tests can tamper with stored bytes behind the
/// adapter's back and simulate outages or latency.
pub struct InMemoryObjectLockClient {
    buckets: RwLock<HashMap<String, BTreeMap<String, SimObject>>>,
    unavailable: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryObjectLockClient {
    /// Creates a client with one lock-enabled bucket.
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(bucket.into(), BTreeMap::new());
        Self {
            buckets: RwLock::new(buckets),
            unavailable: AtomicBool::new(false),
            latency: RwLock::new(None),
        }
    }

    /// Replaces stored bytes without touching metadata.
    pub fn tamper(&self, bucket: &str, key: &str, body: impl Into<Bytes>) -> bool {
        let mut buckets = self.buckets.write();
        match buckets.get_mut(bucket).and_then(|b| b.get_mut(key)) {
            Some(obj) => {
                obj.body = body.into();
                true
            }
            None => false,
        }
    }

    /// Simulates a network outage for all subsequent calls.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    async fn enter(&self) -> Result<(), NativeError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NativeError::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn no_such_key(key: &str) -> NativeError {
        NativeError::http(404, "NoSuchKey", format!("The specified key does not exist: {}", key))
    }

    fn no_such_bucket(bucket: &str) -> NativeError {
        NativeError::http(404, "NoSuchBucket", format!("The specified bucket does not exist: {}", bucket))
    }

    fn with_object<T>(
        &self,
        bucket: &str,
        key: &str,
        f: impl FnOnce(&mut SimObject) -> Result<T, NativeError>,
    ) -> Result<T, NativeError> {
        let mut buckets = self.buckets.write();
        let objects = buckets.get_mut(bucket).ok_or_else(|| Self::no_such_bucket(bucket))?;
        let obj = objects.get_mut(key).ok_or_else(|| Self::no_such_key(key))?;
        f(obj)
    }
}

fn is_locked(head: &HeadObjectOutput, now: DateTime<Utc>) -> Option<RetentionMode> {
    match (head.lock_mode, head.retain_until) {
        (Some(mode), Some(until)) if now < until => Some(mode),
        _ => None,
    }
}

#[async_trait]
impl ObjectLockClient for InMemoryObjectLockClient {
    async fn head_bucket(&self, bucket: &str) -> Result<(), NativeError> {
        self.enter().await?;
        if self.buckets.read().contains_key(bucket) {
            Ok(())
        } else {
            Err(Self::no_such_bucket(bucket))
        }
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<HeadObjectOutput, NativeError> {
        self.enter().await?;
        self.with_object(bucket, key, |obj| Ok(obj.head.clone()))
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectOutput, NativeError> {
        self.enter().await?;
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(&request.bucket)
            .ok_or_else(|| Self::no_such_bucket(&request.bucket))?;

        let version_id = uuid::Uuid::new_v4().simple().to_string();
        let etag = format!("\"{}\"", &crate::hash::sha256_hex(&request.body)[..32]);
        if objects.contains_key(&request.key) {
            warn!(key = %request.key, "Simulated object store overwriting current version");
        }

        let head = HeadObjectOutput {
            content_length: request.body.len() as u64,
            content_type: request.content_type,
            metadata: request.metadata,
            last_modified: Utc::now(),
            version_id: version_id.clone(),
            etag: etag.clone(),
            lock_mode: request.lock_mode,
            retain_until: request.retain_until,
            legal_hold: request.legal_hold,
        };
        objects.insert(
            request.key,
            SimObject {
                body: request.body,
                head,
            },
        );
        Ok(PutObjectOutput { version_id, etag })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(Bytes, HeadObjectOutput), NativeError> {
        self.enter().await?;
        self.with_object(bucket, key, |obj| Ok((obj.body.clone(), obj.head.clone())))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<String>, NativeError> {
        self.enter().await?;
        let buckets = self.buckets.read();
        let objects = buckets.get(bucket).ok_or_else(|| Self::no_such_bucket(bucket))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .take(max_keys)
            .cloned()
            .collect())
    }

    async fn put_object_retention(
        &self,
        bucket: &str,
        key: &str,
        mode: RetentionMode,
        retain_until: DateTime<Utc>,
        bypass_governance: bool,
    ) -> Result<(), NativeError> {
        self.enter().await?;
        self.with_object(bucket, key, |obj| {
            if let Some(current_mode) = is_locked(&obj.head, Utc::now()) {
                let current_until = obj.head.retain_until.unwrap_or(retain_until);
                let shortens = retain_until < current_until;
                let weakens = current_mode == RetentionMode::Compliance
                    && mode == RetentionMode::Governance;
                let allowed = match current_mode {
                    RetentionMode::Compliance => !shortens && !weakens,
                    RetentionMode::Governance => !shortens || bypass_governance,
                };
                if !allowed {
                    return Err(NativeError::http(403, "AccessDenied", "Access Denied"));
                }
            }
            obj.head.lock_mode = Some(mode);
            obj.head.retain_until = Some(retain_until);
            Ok(())
        })
    }

    async fn put_object_legal_hold(
        &self,
        bucket: &str,
        key: &str,
        on: bool,
    ) -> Result<(), NativeError> {
        self.enter().await?;
        self.with_object(bucket, key, |obj| {
            obj.head.legal_hold = on;
            Ok(())
        })
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        bypass_governance: bool,
    ) -> Result<(), NativeError> {
        self.enter().await?;
        let mut buckets = self.buckets.write();
        let objects = buckets.get_mut(bucket).ok_or_else(|| Self::no_such_bucket(bucket))?;
        let obj = objects.get(key).ok_or_else(|| Self::no_such_key(key))?;

        if obj.head.legal_hold {
            return Err(NativeError::http(403, "AccessDenied", "Object is under legal hold"));
        }
        match is_locked(&obj.head, Utc::now()) {
            Some(RetentionMode::Compliance) => {
                return Err(NativeError::http(403, "AccessDenied", "Object is WORM protected"));
            }
            Some(RetentionMode::Governance) if !bypass_governance => {
                return Err(NativeError::http(403, "AccessDenied", "Object is WORM protected"));
            }
            _ => {}
        }
        objects.remove(key);
        Ok(())
    }
}
