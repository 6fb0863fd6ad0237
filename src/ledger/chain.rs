//! The chained ledger and its verifier.

use super::entry::{AuditEntry, AuditEvent, GENESIS_HASH};
use super::store::LedgerStore;
use crate::error::{Result, VaultError};
use crate::observability::{self, ledger_timer};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// An evidence leaf not yet covered by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLeaf {
    /// Sequence of the `EVIDENCE_SUBMITTED` entry carrying the leaf.
    pub sequence: u64,
    pub leaf_hash: String,
}

struct Tail {
    last_hash: String,
    next_sequence: u64,
    pending: Vec<PendingLeaf>,
}

/// Append-only hash chain over a [`LedgerStore`].
pub struct AuditLedger {
    store: Arc<dyn LedgerStore>,
    tail: Mutex<Tail>,
}

impl AuditLedger {
    /// Opens the ledger, verifying whatever the store already holds and
    /// restoring the tail and the leaves pending since the last checkpoint.
    pub async fn open(store: Arc<dyn LedgerStore>) -> Result<Self> {
        let entries = store.load_all().await?;
        verify_entries(&entries)?;

        let last_hash = entries
            .last()
            .map(|e| e.current_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let checkpointed_through = last_checkpoint_sequence(&entries);
        let pending: Vec<PendingLeaf> = entries
            .iter()
            .filter(|e| checkpointed_through.map_or(true, |through| e.sequence > through))
            .filter_map(|e| {
                e.leaf_hash().map(|leaf| PendingLeaf {
                    sequence: e.sequence,
                    leaf_hash: leaf.to_string(),
                })
            })
            .collect();

        info!(
            entries = entries.len(),
            pending_leaves = pending.len(),
            "Audit ledger opened"
        );
        observability::set_pending_leaves(pending.len());

        Ok(Self {
            store,
            tail: Mutex::new(Tail {
                last_hash,
                next_sequence: entries.len() as u64,
                pending,
            }),
        })
    }

    /// Appends an entry chained to the current tail.
    ///
    /// The tail only advances after the store has durably accepted the
    /// entry; a failed append leaves the ledger unchanged.
    pub async fn append(
        &self,
        event: AuditEvent,
        actor: &str,
        details: Value,
    ) -> Result<AuditEntry> {
        let _timer = ledger_timer();
        let mut tail = self.tail.lock().await;

        let entry = AuditEntry::new(tail.next_sequence, &tail.last_hash, event, actor, details);
        self.store.append_entry(&entry).await?;

        tail.last_hash = entry.current_hash.clone();
        tail.next_sequence += 1;
        if let Some(leaf) = entry.leaf_hash() {
            tail.pending.push(PendingLeaf {
                sequence: entry.sequence,
                leaf_hash: leaf.to_string(),
            });
            observability::set_pending_leaves(tail.pending.len());
        }
        drop(tail);

        observability::record_audit_entry(event.as_str());
        debug!(
            sequence = entry.sequence,
            event = %event,
            actor = %actor,
            hash = %entry.current_hash,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Snapshot of the leaves not yet covered by a checkpoint, in append
    /// order.
    pub async fn pending_leaves(&self) -> Vec<PendingLeaf> {
        self.tail.lock().await.pending.clone()
    }

    /// Drops pending leaves up to and including `through_sequence`.
    pub async fn acknowledge(&self, through_sequence: u64) {
        let mut tail = self.tail.lock().await;
        tail.pending.retain(|leaf| leaf.sequence > through_sequence);
        observability::set_pending_leaves(tail.pending.len());
    }

    /// `current_hash` of the tail entry, or the genesis value.
    pub async fn head_hash(&self) -> String {
        self.tail.lock().await.last_hash.clone()
    }

    /// Number of entries appended so far.
    pub async fn len(&self) -> u64 {
        self.tail.lock().await.next_sequence
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All persisted entries. Does not take the append lock.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.store.load_all().await
    }

    /// History of one evidence key.
    pub async fn entries_for_key(&self, key: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.evidence_key() == Some(key))
            .collect())
    }

    /// Most recent `CHECKPOINT_CREATED` entry.
    pub async fn last_checkpoint_entry(&self) -> Result<Option<AuditEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .rev()
            .find(|e| e.event == AuditEvent::CheckpointCreated))
    }

    /// Walks the full chain from genesis. Returns the number of entries
    /// verified, or `ChainBroken` at the first bad position.
    pub async fn verify_chain(&self) -> Result<u64> {
        let entries = self.entries().await?;
        verify_entries(&entries)?;
        Ok(entries.len() as u64)
    }
}

/// Verifies a full chain: positions are contiguous from zero, each entry
/// links to its predecessor, and each hash recomputes.
pub fn verify_entries(entries: &[AuditEntry]) -> Result<()> {
    let mut expected_previous = GENESIS_HASH;
    for (position, entry) in entries.iter().enumerate() {
        let position = position as u64;
        let broken = |reason: String| {
            error!(position, entry_id = %entry.id, reason = %reason, "Audit chain verification failed");
            VaultError::ChainBroken {
                position,
                entry_id: entry.id.clone(),
                reason,
            }
        };

        if entry.sequence != position {
            return Err(broken(format!("sequence {} at position {}", entry.sequence, position)));
        }
        if entry.previous_hash != expected_previous {
            return Err(broken("previous hash does not match the preceding entry".to_string()));
        }
        if entry.recompute_hash() != entry.current_hash {
            return Err(broken("current hash does not match entry contents".to_string()));
        }
        expected_previous = &entry.current_hash;
    }
    Ok(())
}

fn last_checkpoint_sequence(entries: &[AuditEntry]) -> Option<u64> {
    entries
        .iter()
        .rev()
        .find(|e| e.event == AuditEvent::CheckpointCreated)
        .and_then(|e| e.details.get("through_sequence"))
        .and_then(Value::as_u64)
}
