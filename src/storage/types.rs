//! Backend-agnostic storage types.

use crate::retention::{AppliedRetention, RetentionPolicy};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default truncation for `list`.
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// An immutable stored object as returned by `store`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    /// SHA-256 hex of the exact bytes handed to `store`.
    pub content_hash: String,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
    pub retention: Option<AppliedRetention>,
    /// Opaque backend details (version ids, etags, row ids).
    #[serde(default)]
    pub provider_metadata: HashMap<String, String>,
}

/// Retrieval-time view of a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    /// Hash recorded at store time. `None` if the medium lost it, in which
    /// case integrity cannot be verified.
    pub content_hash: Option<String>,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
    pub retention: Option<AppliedRetention>,
    pub legal_hold: bool,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub provider_metadata: HashMap<String, String>,
}

/// Bytes plus metadata returned from `retrieve`.
#[derive(Debug, Clone)]
pub struct RetrievedObject {
    pub data: Bytes,
    pub metadata: ObjectMetadata,
    /// SHA-256 of `data` as returned, for comparison against
    /// `metadata.content_hash`.
    pub computed_hash: String,
}

impl RetrievedObject {
    /// True if the returned bytes hash to the value recorded at store time.
    pub fn matches_recorded_hash(&self) -> bool {
        self.metadata.content_hash.as_deref() == Some(self.computed_hash.as_str())
    }
}

/// Options accepted by `store`.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub retention: Option<RetentionPolicy>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A fully prepared write handed from the façade to an adapter.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub key: String,
    pub data: Bytes,
    pub content_hash: String,
    pub stored_at: DateTime<Utc>,
    pub retention: Option<AppliedRetention>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl NewObject {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// The `StoredObject` describing this write once it has landed.
    pub fn into_stored(self, provider_metadata: HashMap<String, String>) -> StoredObject {
        StoredObject {
            size: self.data.len() as u64,
            key: self.key,
            content_hash: self.content_hash,
            stored_at: self.stored_at,
            retention: self.retention,
            provider_metadata,
        }
    }
}

/// Static per-backend declaration of guarantees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCapabilities {
    #[serde(rename = "supportsWORM")]
    pub supports_worm: bool,
    #[serde(rename = "supportsLegalHold")]
    pub supports_legal_hold: bool,
    #[serde(rename = "supportsRetention")]
    pub supports_retention: bool,
    #[serde(rename = "maxObjectSize")]
    pub max_object_size: u64,
    #[serde(rename = "providerName")]
    pub provider_name: String,
}
