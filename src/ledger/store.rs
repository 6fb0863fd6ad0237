//! Durable persistence of ledger entries.

use super::entry::AuditEntry;
use crate::error::{Result, StorageError, VaultError};
use crate::retention::RetentionPolicy;
use crate::storage::{EvidenceStorage, StoreOptions};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Key prefix of persisted ledger entries.
pub const AUDIT_PREFIX: &str = "audit/";

/// Where ledger entries live. An append is durable once it returns `Ok`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persists one entry. Must refuse a sequence number already taken.
    async fn append_entry(&self, entry: &AuditEntry) -> Result<()>;

    /// All entries in sequence order.
    async fn load_all(&self) -> Result<Vec<AuditEntry>>;
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryLedgerStore {
    entries: RwLock<Vec<AuditEntry>>,
    failing_appends: AtomicUsize,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edits a stored entry in place, bypassing the chain. Returns false if
    /// there is no entry at `position`.
    pub fn tamper<F>(&self, position: usize, f: F) -> bool
    where
        F: FnOnce(&mut AuditEntry),
    {
        match self.entries.write().get_mut(position) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Makes the next `count` appends fail with `CONNECTION_FAILED`, as an
    /// unreachable durable store would.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append_entry(&self, entry: &AuditEntry) -> Result<()> {
        let failing = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::ConnectionFailed(format!(
                "ledger store unavailable for entry {}",
                entry.sequence
            ))
            .into());
        }

        let mut entries = self.entries.write();
        if entry.sequence != entries.len() as u64 {
            return Err(StorageError::AlreadyExists(format!(
                "ledger position {} (length {})",
                entry.sequence,
                entries.len()
            ))
            .into());
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.read().clone())
    }
}

/// Persists each entry as its own immutable object through the storage
/// façade, at `audit/<20-digit sequence>.json`.
pub struct StorageLedgerStore {
    storage: EvidenceStorage,
    retention: Option<RetentionPolicy>,
}

impl StorageLedgerStore {
    pub fn new(storage: EvidenceStorage) -> Self {
        Self {
            storage,
            retention: None,
        }
    }

    /// Retention applied to every entry object.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn entry_key(sequence: u64) -> String {
        format!("{}{:020}.json", AUDIT_PREFIX, sequence)
    }
}

#[async_trait]
impl LedgerStore for StorageLedgerStore {
    async fn append_entry(&self, entry: &AuditEntry) -> Result<()> {
        let key = Self::entry_key(entry.sequence);
        let body = serde_json::to_vec(entry)?;
        let mut options = StoreOptions::new()
            .with_content_type("application/json")
            .with_metadata("event", entry.event.as_str());
        if let Some(retention) = self.retention {
            options = options.with_retention(retention);
        }
        // ALREADY_EXISTS on a taken position comes straight from the façade.
        self.storage.store(&key, body, options).await?;
        debug!(key = %key, event = %entry.event, "Persisted audit entry");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditEntry>> {
        let keys = self.storage.list(AUDIT_PREFIX, Some(usize::MAX)).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for (position, key) in keys.iter().enumerate() {
            let retrieved = self.storage.retrieve(key).await?;
            if !retrieved.matches_recorded_hash() {
                return Err(VaultError::ChainBroken {
                    position: position as u64,
                    entry_id: key.clone(),
                    reason: "stored entry bytes do not match their recorded content hash"
                        .to_string(),
                });
            }
            let entry: AuditEntry =
                serde_json::from_slice(&retrieved.data).map_err(|e| VaultError::ChainBroken {
                    position: position as u64,
                    entry_id: key.clone(),
                    reason: format!("unreadable entry: {}", e),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entry::{AuditEvent, GENESIS_HASH};
    use crate::storage::RelationalBackend;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_store_refuses_taken_position() {
        let store = MemoryLedgerStore::new();
        let first = AuditEntry::new(0, GENESIS_HASH, AuditEvent::ChainVerified, "a", json!({}));
        store.append_entry(&first).await.unwrap();
        let err = store.append_entry(&first).await.unwrap_err();
        assert_eq!(err.storage_kind(), Some(crate::error::ErrorKind::AlreadyExists));
    }

    #[tokio::test]
    async fn test_memory_store_injected_failures() {
        let store = MemoryLedgerStore::new();
        let first = AuditEntry::new(0, GENESIS_HASH, AuditEvent::ChainVerified, "a", json!({}));
        store.fail_next_appends(1);
        let err = store.append_entry(&first).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.load_all().await.unwrap().is_empty());

        store.append_entry(&first).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_store_roundtrip_in_order() {
        let storage = EvidenceStorage::new(Arc::new(RelationalBackend::open_in_memory().unwrap()));
        let store = StorageLedgerStore::new(storage.clone());

        let mut prev = GENESIS_HASH.to_string();
        for seq in 0..12 {
            let entry = AuditEntry::new(seq, &prev, AuditEvent::EvidenceAccessed, "a", json!({"n": seq}));
            prev = entry.current_hash.clone();
            store.append_entry(&entry).await.unwrap();
        }

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 12);
        // Zero padding keeps lexicographic order equal to sequence order.
        assert!(loaded.iter().enumerate().all(|(i, e)| e.sequence == i as u64));
        assert!(storage.exists("audit/00000000000000000011.json").await.unwrap());
    }
}
