//! The storage façade.

use super::types::{
    NewObject, ObjectMetadata, RetrievedObject, StorageCapabilities, StoreOptions, StoredObject,
    DEFAULT_LIST_LIMIT,
};
use super::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::hash::sha256_hex;
use crate::observability::{self, storage_timer};
use crate::retention::{self, AppliedRetention, RetentionMode, RetentionPolicy};
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default per-call timeout against the backend.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend-agnostic evidence storage.
///
/// Wraps one [`StorageBackend`]. Holds no lock of its own, so operations on
/// distinct keys run concurrently. Each backend call is bounded by a timeout
/// that surfaces as `CONNECTION_FAILED`; after a timed-out `store` the write
/// may still have landed, and only [`EvidenceStorage::exists`] resolves that.
#[derive(Clone)]
pub struct EvidenceStorage {
    backend: Arc<dyn StorageBackend>,
    capabilities: StorageCapabilities,
    key_prefix: String,
    timeout: Duration,
}

impl EvidenceStorage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let capabilities = backend.capabilities();
        Self {
            backend,
            capabilities,
            key_prefix: String::new(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Namespaces every key under `prefix`. Callers keep using unprefixed keys.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Static guarantees of the wrapped backend.
    pub fn capabilities(&self) -> &StorageCapabilities {
        &self.capabilities
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Stores new, immutable evidence bytes.
    ///
    /// The content hash is taken over exactly `data`. Fails `ALREADY_EXISTS`
    /// if the key is present. A compliance-mode retention request against a
    /// backend that cannot enforce WORM fails `NOT_SUPPORTED` up front.
    pub async fn store(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        options: StoreOptions,
    ) -> StorageResult<StoredObject> {
        let data = data.into();
        let full_key = self.full_key(key)?;

        if data.len() as u64 > self.capabilities.max_object_size {
            return Err(StorageError::NotSupported(format!(
                "{} bytes exceeds the {} limit of {} bytes",
                data.len(),
                self.capabilities.provider_name,
                self.capabilities.max_object_size
            )));
        }
        if let Some(policy) = &options.retention {
            self.check_enforceable(policy)?;
        }

        let stored_at = Utc::now().trunc_subsecs(6);
        let retention = options.retention.map(|p| p.apply(stored_at)).transpose()?;
        let object = NewObject {
            key: full_key.clone(),
            content_hash: sha256_hex(&data),
            data,
            stored_at,
            retention,
            content_type: options.content_type,
            metadata: options.metadata,
        };
        let size = object.size();

        let mut stored = self.call("store", self.backend.put(object)).await?;
        stored.key = key.to_string();

        observability::record_object_stored(size);
        debug!(key = %full_key, size, hash = %stored.content_hash, "Stored evidence object");
        Ok(stored)
    }

    /// Reads bytes and metadata and recomputes the hash of the returned bytes.
    pub async fn retrieve(&self, key: &str) -> StorageResult<RetrievedObject> {
        let full_key = self.full_key(key)?;
        let (data, mut metadata) = self.call("retrieve", self.backend.get(&full_key)).await?;
        metadata.key = key.to_string();
        let computed_hash = sha256_hex(&data);
        Ok(RetrievedObject {
            data,
            metadata,
            computed_hash,
        })
    }

    /// Compares the hash of the bytes currently stored against the hash
    /// recorded at store time. A missing recorded hash counts as a failure.
    pub async fn verify_integrity(&self, key: &str) -> StorageResult<bool> {
        let retrieved = self.retrieve(key).await?;
        let ok = retrieved.matches_recorded_hash();
        if !ok {
            warn!(
                key = %key,
                recorded = ?retrieved.metadata.content_hash,
                computed = %retrieved.computed_hash,
                "Integrity check failed"
            );
        }
        Ok(ok)
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        let full_key = self.full_key(key)?;
        self.call("exists", self.backend.exists(&full_key)).await
    }

    /// Metadata without the bytes.
    pub async fn metadata(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let full_key = self.full_key(key)?;
        let mut metadata = self.call("metadata", self.backend.head(&full_key)).await?;
        metadata.key = key.to_string();
        Ok(metadata)
    }

    /// Keys under `prefix` in lexicographic order, at most `limit`
    /// (default 1000).
    pub async fn list(&self, prefix: &str, limit: Option<usize>) -> StorageResult<Vec<String>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let full_prefix = format!("{}{}", self.key_prefix, prefix);
        let mut keys = self
            .call("list", self.backend.list(&full_prefix, limit))
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(self.key_prefix.as_str()).map(str::to_string))
            .collect::<Vec<_>>();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    pub async fn apply_legal_hold(&self, key: &str) -> StorageResult<()> {
        self.set_legal_hold(key, true).await
    }

    pub async fn remove_legal_hold(&self, key: &str) -> StorageResult<()> {
        self.set_legal_hold(key, false).await
    }

    async fn set_legal_hold(&self, key: &str, on: bool) -> StorageResult<()> {
        let op = if on { "apply_legal_hold" } else { "remove_legal_hold" };
        if !self.capabilities.supports_legal_hold {
            let err = StorageError::NotSupported(format!(
                "{} backend has no legal hold",
                self.capabilities.provider_name
            ));
            observability::record_storage_error(op, err.code());
            return Err(err);
        }
        let full_key = self.full_key(key)?;
        if !self.call(op, self.backend.exists(&full_key)).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        self.call(op, self.backend.set_legal_hold(&full_key, on)).await?;
        info!(key = %key, on, "Legal hold changed");
        Ok(())
    }

    /// Replaces the retention on an existing object, subject to the
    /// monotonic-extension rule for compliance mode.
    pub async fn extend_retention(
        &self,
        key: &str,
        policy: RetentionPolicy,
        bypass_governance: bool,
    ) -> StorageResult<AppliedRetention> {
        self.check_enforceable(&policy)?;
        let full_key = self.full_key(key)?;
        let applied = policy.apply(Utc::now().trunc_subsecs(6))?;
        self.call(
            "extend_retention",
            self.backend.set_retention(&full_key, applied, bypass_governance),
        )
        .await?;
        info!(key = %key, until = %applied.retain_until, mode = %applied.mode, "Retention updated");
        Ok(applied)
    }

    /// Deletes an object whose retention has expired and which carries no
    /// legal hold.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let full_key = self.full_key(key)?;
        let metadata = self.call("delete", self.backend.head(&full_key)).await?;
        let expiry = metadata.retention.map(|r| r.retain_until);
        if !retention::is_deletable(expiry, metadata.legal_hold, Utc::now()) {
            let err = StorageError::PermissionDenied(format!(
                "{} is under {}",
                key,
                if metadata.legal_hold { "legal hold" } else { "retention" }
            ));
            observability::record_storage_error("delete", err.code());
            return Err(err);
        }
        self.call("delete", self.backend.delete(&full_key)).await?;
        info!(key = %key, "Deleted evidence object");
        Ok(())
    }

    /// Best-effort reachability probe. Never fails.
    pub async fn health_check(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.backend.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, provider = %self.capabilities.provider_name, "Health check failed");
                false
            }
            Err(_) => {
                warn!(provider = %self.capabilities.provider_name, "Health check timed out");
                false
            }
        }
    }

    fn check_enforceable(&self, policy: &RetentionPolicy) -> StorageResult<()> {
        if policy.mode == RetentionMode::Compliance && !self.capabilities.supports_worm {
            return Err(StorageError::NotSupported(format!(
                "{} backend cannot enforce compliance retention",
                self.capabilities.provider_name
            )));
        }
        Ok(())
    }

    fn full_key(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.key_prefix, key))
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        let _timer = storage_timer(op);
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::ConnectionFailed(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        };
        if let Err(e) = &result {
            observability::record_storage_error(op, e.code());
        }
        result
    }
}

/// Keys are relative, slash-separated paths.
fn validate_key(key: &str) -> StorageResult<()> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.starts_with('/') {
        Some("key must not start with '/'")
    } else if key.contains('\0') {
        Some("key contains NUL")
    } else if key.split('/').any(|seg| seg == ".." || seg == ".") {
        Some("key contains a relative path segment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StorageError::Unknown(format!("invalid key '{}': {}", key, reason))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryObjectLockClient, ObjectLockBackend, RelationalBackend};

    fn object_lock() -> (Arc<InMemoryObjectLockClient>, EvidenceStorage) {
        let client = Arc::new(InMemoryObjectLockClient::with_bucket("vault"));
        let backend = ObjectLockBackend::new(client.clone(), "vault", RetentionMode::Compliance);
        (client, EvidenceStorage::new(Arc::new(backend)))
    }

    #[tokio::test]
    async fn test_store_retrieve_hash() {
        let (_client, storage) = object_lock();
        let stored = storage
            .store("ctrl-1/a.pdf", &b"evidence"[..], StoreOptions::new())
            .await
            .unwrap();
        assert_eq!(stored.content_hash, sha256_hex(b"evidence"));
        assert_eq!(stored.size, 8);

        let retrieved = storage.retrieve("ctrl-1/a.pdf").await.unwrap();
        assert_eq!(&retrieved.data[..], b"evidence");
        assert_eq!(retrieved.computed_hash, stored.content_hash);
        assert!(storage.verify_integrity("ctrl-1/a.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_key_prefix_is_transparent() {
        let (client, storage) = object_lock();
        let storage = storage.with_key_prefix("tenant-a/");
        storage.store("x/1", &b"1"[..], StoreOptions::new()).await.unwrap();

        assert!(client.tamper("vault", "tenant-a/x/1", &b"2"[..]));
        assert_eq!(storage.list("x/", None).await.unwrap(), vec!["x/1"]);
        assert!(!storage.verify_integrity("x/1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let (_client, storage) = object_lock();
        for key in ["", "/abs", "a/../b", "a\0b", "./a"] {
            let err = storage.store(key, &b"x"[..], StoreOptions::new()).await.unwrap_err();
            assert_eq!(err.code(), "UNKNOWN", "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_compliance_rejected_on_non_worm() {
        let storage = EvidenceStorage::new(Arc::new(RelationalBackend::open_in_memory().unwrap()));
        let err = storage
            .store(
                "k",
                &b"x"[..],
                StoreOptions::new().with_retention(RetentionPolicy::compliance(30)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_SUPPORTED");
        assert!(!storage.exists("k").await.unwrap());

        // Governance retention is accepted as bookkeeping.
        let stored = storage
            .store(
                "k",
                &b"x"[..],
                StoreOptions::new().with_retention(RetentionPolicy::governance(30)),
            )
            .await
            .unwrap();
        assert_eq!(stored.retention.unwrap().mode, RetentionMode::Governance);
    }

    #[tokio::test]
    async fn test_delete_respects_hold_and_retention() {
        let (_client, storage) = object_lock();
        storage
            .store(
                "locked",
                &b"x"[..],
                StoreOptions::new().with_retention(RetentionPolicy::compliance(1)),
            )
            .await
            .unwrap();
        assert_eq!(storage.delete("locked").await.unwrap_err().code(), "PERMISSION_DENIED");

        storage.store("free", &b"y"[..], StoreOptions::new()).await.unwrap();
        storage.apply_legal_hold("free").await.unwrap();
        assert_eq!(storage.delete("free").await.unwrap_err().code(), "PERMISSION_DENIED");
        storage.remove_legal_hold("free").await.unwrap();
        storage.delete("free").await.unwrap();
        assert!(!storage.exists("free").await.unwrap());
    }

    #[tokio::test]
    async fn test_legal_hold_missing_key() {
        let (_client, storage) = object_lock();
        assert_eq!(storage.apply_legal_hold("ghost").await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_connection_failed() {
        let (client, storage) = object_lock();
        let storage = storage.with_timeout(Duration::from_millis(20));
        client.set_latency(Some(Duration::from_millis(200)));
        let err = storage.exists("slow").await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert!(err.is_retryable());
        assert!(!storage.health_check().await);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (client, storage) = object_lock();
        assert!(storage.health_check().await);
        client.set_unavailable(true);
        assert!(!storage.health_check().await);
    }
}
