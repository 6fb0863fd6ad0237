//! Immutable-policy blob store adapter.
//!
//! The medium attaches a time-based immutability policy to each blob (an
//! absolute expiry, either `Locked` or `Unlocked`) and an independent legal
//! hold flag. Locked policies map to COMPLIANCE retention, unlocked to
//! GOVERNANCE. Expiry is read back as an absolute instant and reported to
//! callers both as an instant and as remaining whole days.

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
use tracing::{debug, info};

const META_CONTENT_HASH: &str = "contentsha256";
const META_STORED_AT: &str = "storedat";

/// Block blob upper bound of the medium (~190.7 TiB).
const MAX_BLOB_SIZE: u64 = 50_000 * 4000 * 1024 * 1024;

/// Immutability policy state as the blob medium names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    Locked,
    Unlocked,
}

impl From<RetentionMode> for PolicyMode {
    fn from(mode: RetentionMode) -> Self {
        match mode {
            RetentionMode::Compliance => PolicyMode::Locked,
            RetentionMode::Governance => PolicyMode::Unlocked,
        }
    }
}

impl From<PolicyMode> for RetentionMode {
    fn from(mode: PolicyMode) -> Self {
        match mode {
            PolicyMode::Locked => RetentionMode::Compliance,
            PolicyMode::Unlocked => RetentionMode::Governance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmutabilityPolicy {
    pub expires_on: DateTime<Utc>,
    pub mode: PolicyMode,
}

/// Blob properties as returned by the medium.
#[derive(Debug, Clone)]
pub struct BlobProperties {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_on: DateTime<Utc>,
    pub etag: String,
    pub immutability_policy: Option<ImmutabilityPolicy>,
    pub legal_hold: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Conditional create (`If-None-Match: *`).
    pub if_none_match_any: bool,
    pub immutability_policy: Option<ImmutabilityPolicy>,
}

/// The subset of the blob API the adapter uses.
#[async_trait]
pub trait BlobContainerClient: Send + Sync {
    async fn get_container_properties(&self, container: &str) -> Result<(), NativeError>;

    async fn get_blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, NativeError>;

    async fn upload_blob(
        &self,
        container: &str,
        blob: &str,
        body: Bytes,
        options: UploadOptions,
    ) -> Result<String, NativeError>;

    async fn download_blob(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<(Bytes, BlobProperties), NativeError>;

    async fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        max_results: usize,
    ) -> Result<Vec<String>, NativeError>;

    async fn set_immutability_policy(
        &self,
        container: &str,
        blob: &str,
        policy: ImmutabilityPolicy,
    ) -> Result<(), NativeError>;

    async fn delete_immutability_policy(&self, container: &str, blob: &str)
        -> Result<(), NativeError>;

    async fn set_legal_hold(&self, container: &str, blob: &str, on: bool)
        -> Result<(), NativeError>;

    async fn delete_blob(&self, container: &str, blob: &str) -> Result<(), NativeError>;
}

/// Adapter for the immutable-policy blob store.
pub struct ImmutableBlobBackend {
    client: Arc<dyn BlobContainerClient>,
    container: String,
}

impl ImmutableBlobBackend {
    pub fn new(client: Arc<dyn BlobContainerClient>, container: impl Into<String>) -> Self {
        Self {
            client,
            container: container.into(),
        }
    }

    fn to_metadata(&self, key: &str, props: BlobProperties) -> ObjectMetadata {
        let now = Utc::now();
        let retention = props.immutability_policy.map(|p| AppliedRetention {
            mode: p.mode.into(),
            retain_until: p.expires_on,
        });

        let mut metadata = props.metadata;
        let content_hash = metadata.remove(META_CONTENT_HASH);
        let stored_at = metadata
            .remove(META_STORED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(props.created_on);

        let mut provider_metadata = HashMap::new();
        provider_metadata.insert("container".to_string(), self.container.clone());
        provider_metadata.insert("etag".to_string(), props.etag);
        if let Some(r) = &retention {
            provider_metadata.insert(
                "retention_days_remaining".to_string(),
                r.remaining_days(now).to_string(),
            );
        }

        ObjectMetadata {
            key: key.to_string(),
            content_hash,
            size: props.content_length,
            stored_at,
            retention,
            legal_hold: props.legal_hold,
            content_type: props.content_type,
            metadata,
            provider_metadata,
        }
    }
}

#[async_trait]
impl StorageBackend for ImmutableBlobBackend {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            supports_worm: true,
            supports_legal_hold: true,
            supports_retention: true,
            max_object_size: MAX_BLOB_SIZE,
            provider_name: "immutable-blob".to_string(),
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

        let options = UploadOptions {
            content_type: object.content_type.clone(),
            metadata,
            if_none_match_any: true,
            immutability_policy: object.retention.map(|r| ImmutabilityPolicy {
                expires_on: r.retain_until,
                mode: r.mode.into(),
            }),
        };

        let etag = self
            .client
            .upload_blob(&self.container, &object.key, object.data.clone(), options)
            .await
            .map_err(|e| e.into_storage(&format!("upload {}", object.key)))?;

        debug!(container = %self.container, key = %object.key, "Uploaded immutable blob");

        let mut provider = HashMap::new();
        provider.insert("container".to_string(), self.container.clone());
        provider.insert("etag".to_string(), etag);
        if let Some(r) = &object.retention {
            provider.insert(
                "retention_days_remaining".to_string(),
                r.remaining_days(object.stored_at).to_string(),
            );
        }
        Ok(object.into_stored(provider))
    }

    async fn get(&self, key: &str) -> StorageResult<(Bytes, ObjectMetadata)> {
        let (body, props) = self
            .client
            .download_blob(&self.container, key)
            .await
            .map_err(|e| e.into_storage(&format!("download {}", key)))?;
        Ok((body, self.to_metadata(key, props)))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let props = self
            .client
            .get_blob_properties(&self.container, key)
            .await
            .map_err(|e| e.into_storage(&format!("properties {}", key)))?;
        Ok(self.to_metadata(key, props))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.client.get_blob_properties(&self.container, key).await {
            Ok(_) => Ok(true),
            Err(e) => match e.into_storage(&format!("properties {}", key)) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> StorageResult<Vec<String>> {
        self.client
            .list_blobs(&self.container, prefix, limit)
            .await
            .map_err(|e| e.into_storage(&format!("list {}", prefix)))
    }

    async fn set_legal_hold(&self, key: &str, on: bool) -> StorageResult<()> {
        self.client
            .set_legal_hold(&self.container, key, on)
            .await
            .map_err(|e| e.into_storage(&format!("legal hold {}", key)))?;
        info!(container = %self.container, key = %key, on, "Updated legal hold");
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

        // Unlocked policies must be deleted before they can be shortened.
        if let Some(current) = current {
            if bypass_governance
                && current.mode == RetentionMode::Governance
                && requested.retain_until < current.retain_until
            {
                self.client
                    .delete_immutability_policy(&self.container, key)
                    .await
                    .map_err(|e| e.into_storage(&format!("retention {}", key)))?;
            }
        }

        self.client
            .set_immutability_policy(
                &self.container,
                key,
                ImmutabilityPolicy {
                    expires_on: requested.retain_until,
                    mode: requested.mode.into(),
                },
            )
            .await
            .map_err(|e| e.into_storage(&format!("retention {}", key)))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_blob(&self.container, key)
            .await
            .map_err(|e| e.into_storage(&format!("delete {}", key)))
    }

    async fn ping(&self) -> StorageResult<()> {
        self.client
            .get_container_properties(&self.container)
            .await
            .map_err(|e| e.into_storage(&format!("container {}", self.container)))
    }
}

#[derive(Debug, Clone)]
struct SimBlob {
    body: Bytes,
    props: BlobProperties,
}

/// In-process stand-in for the immutable-policy blob store.
pub struct InMemoryBlobContainer {
    containers: RwLock<HashMap<String, BTreeMap<String, SimBlob>>>,
    unavailable: AtomicBool,
}

impl InMemoryBlobContainer {
    pub fn with_container(container: impl Into<String>) -> Self {
        let mut containers = HashMap::new();
        containers.insert(container.into(), BTreeMap::new());
        Self {
            containers: RwLock::new(containers),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Replaces stored bytes without touching properties.
    pub fn tamper(&self, container: &str, blob: &str, body: impl Into<Bytes>) -> bool {
        let mut containers = self.containers.write();
        match containers.get_mut(container).and_then(|c| c.get_mut(blob)) {
            Some(b) => {
                b.body = body.into();
                true
            }
            None => false,
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), NativeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NativeError::Http {
                status: 503,
                code: Some("ServerBusy".to_string()),
                message: "The server is currently unable to receive requests".to_string(),
            });
        }
        Ok(())
    }

    fn blob_not_found(blob: &str) -> NativeError {
        NativeError::http(404, "BlobNotFound", format!("The specified blob does not exist: {}", blob))
    }

    fn container_not_found(container: &str) -> NativeError {
        NativeError::http(
            404,
            "ContainerNotFound",
            format!("The specified container does not exist: {}", container),
        )
    }

    fn with_blob<T>(
        &self,
        container: &str,
        blob: &str,
        f: impl FnOnce(&mut SimBlob) -> Result<T, NativeError>,
    ) -> Result<T, NativeError> {
        self.check()?;
        let mut containers = self.containers.write();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| Self::container_not_found(container))?;
        let b = blobs.get_mut(blob).ok_or_else(|| Self::blob_not_found(blob))?;
        f(b)
    }
}

fn active_policy(props: &BlobProperties, now: DateTime<Utc>) -> Option<ImmutabilityPolicy> {
    props.immutability_policy.filter(|p| now < p.expires_on)
}

#[async_trait]
impl BlobContainerClient for InMemoryBlobContainer {
    async fn get_container_properties(&self, container: &str) -> Result<(), NativeError> {
        self.check()?;
        if self.containers.read().contains_key(container) {
            Ok(())
        } else {
            Err(Self::container_not_found(container))
        }
    }

    async fn get_blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, NativeError> {
        self.with_blob(container, blob, |b| Ok(b.props.clone()))
    }

    async fn upload_blob(
        &self,
        container: &str,
        blob: &str,
        body: Bytes,
        options: UploadOptions,
    ) -> Result<String, NativeError> {
        self.check()?;
        let mut containers = self.containers.write();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| Self::container_not_found(container))?;

        if let Some(existing) = blobs.get(blob) {
            if options.if_none_match_any {
                return Err(NativeError::http(409, "BlobAlreadyExists", "The specified blob already exists"));
            }
            if active_policy(&existing.props, Utc::now()).is_some() || existing.props.legal_hold {
                return Err(NativeError::http(409, "BlobImmutableDueToPolicy", "Blob is immutable"));
            }
        }

        let etag = format!("\"0x{}\"", &crate::hash::sha256_hex(&body)[..16].to_uppercase());
        let props = BlobProperties {
            content_length: body.len() as u64,
            content_type: options.content_type,
            metadata: options.metadata,
            created_on: Utc::now(),
            etag: etag.clone(),
            immutability_policy: options.immutability_policy,
            legal_hold: false,
        };
        blobs.insert(blob.to_string(), SimBlob { body, props });
        Ok(etag)
    }

    async fn download_blob(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<(Bytes, BlobProperties), NativeError> {
        self.with_blob(container, blob, |b| Ok((b.body.clone(), b.props.clone())))
    }

    async fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        max_results: usize,
    ) -> Result<Vec<String>, NativeError> {
        self.check()?;
        let containers = self.containers.read();
        let blobs = containers
            .get(container)
            .ok_or_else(|| Self::container_not_found(container))?;
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn set_immutability_policy(
        &self,
        container: &str,
        blob: &str,
        policy: ImmutabilityPolicy,
    ) -> Result<(), NativeError> {
        self.with_blob(container, blob, |b| {
            if let Some(current) = active_policy(&b.props, Utc::now()) {
                if current.mode == PolicyMode::Locked
                    && (policy.expires_on < current.expires_on || policy.mode == PolicyMode::Unlocked)
                {
                    return Err(NativeError::http(
                        409,
                        "ImmutabilityPolicyCannotBeShortened",
                        "A locked immutability policy can only be extended",
                    ));
                }
                if current.mode == PolicyMode::Unlocked && policy.expires_on < current.expires_on {
                    return Err(NativeError::http(
                        409,
                        "ImmutabilityPolicyCannotBeShortened",
                        "Delete the unlocked policy before shortening it",
                    ));
                }
            }
            b.props.immutability_policy = Some(policy);
            Ok(())
        })
    }

    async fn delete_immutability_policy(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<(), NativeError> {
        self.with_blob(container, blob, |b| {
            if let Some(current) = active_policy(&b.props, Utc::now()) {
                if current.mode == PolicyMode::Locked {
                    return Err(NativeError::http(403, "AuthorizationFailure", "Policy is locked"));
                }
            }
            b.props.immutability_policy = None;
            Ok(())
        })
    }

    async fn set_legal_hold(&self, container: &str, blob: &str, on: bool) -> Result<(), NativeError> {
        self.with_blob(container, blob, |b| {
            b.props.legal_hold = on;
            Ok(())
        })
    }

    async fn delete_blob(&self, container: &str, blob: &str) -> Result<(), NativeError> {
        self.check()?;
        let mut containers = self.containers.write();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| Self::container_not_found(container))?;
        let existing = blobs.get(blob).ok_or_else(|| Self::blob_not_found(blob))?;
        if existing.props.legal_hold {
            return Err(NativeError::http(409, "BlobImmutableDueToLegalHold", "Blob is under legal hold"));
        }
        if active_policy(&existing.props, Utc::now()).is_some() {
            return Err(NativeError::http(409, "BlobImmutableDueToPolicy", "Blob is immutable"));
        }
        blobs.remove(blob);
        Ok(())
    }
}
