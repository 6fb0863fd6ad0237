//! Checkpoint creation, persistence and offline verification.

use super::merkle::merkle_root;
use super::signer::{signing_message, verify_signature, CheckpointSigner};
use crate::error::{Result, StorageError, VaultError};
use crate::ledger::{AuditEvent, AuditLedger};
use crate::observability::{self, checkpoint_timer};
use crate::retention::{RetentionPolicy, DEFAULT_RETENTION_DAYS};
use crate::storage::{EvidenceStorage, StoreOptions};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Key prefix of persisted checkpoints.
pub const CHECKPOINT_PREFIX: &str = "checkpoints/";

const DEFAULT_ACTOR: &str = "system:checkpoint";

/// A signed Merkle root over the evidence recorded since the previous
/// checkpoint. Serializes to the persisted JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub merkle_root: String,
    pub event_count: u64,
    /// `None` only for the first checkpoint.
    pub previous_checkpoint: Option<String>,
    /// Base64 ECDSA P-256 signature over [`Checkpoint::signing_message`].
    pub signature: String,
}

impl Checkpoint {
    pub fn signing_message(&self) -> Vec<u8> {
        signing_message(
            &self.merkle_root,
            &self.timestamp,
            self.previous_checkpoint.as_deref(),
        )
    }

    pub fn storage_key(&self) -> String {
        format!("{}{}.json", CHECKPOINT_PREFIX, self.checkpoint_id)
    }
}

/// Head of the checkpoint chain, recovered lazily from the ledger.
#[derive(Default)]
struct ChainHead {
    recovered: bool,
    last_id: Option<String>,
}

/// Builds, signs and persists checkpoints.
pub struct CheckpointEngine {
    storage: EvidenceStorage,
    ledger: Arc<AuditLedger>,
    signer: CheckpointSigner,
    retention: Option<RetentionPolicy>,
    actor: String,
    // Held for a whole run so two runs never sign the same leaves.
    head: Mutex<ChainHead>,
}

impl CheckpointEngine {
    pub fn new(storage: EvidenceStorage, ledger: Arc<AuditLedger>, signer: CheckpointSigner) -> Self {
        let retention = retention_for(&storage, DEFAULT_RETENTION_DAYS);
        Self {
            storage,
            ledger,
            signer,
            retention,
            actor: DEFAULT_ACTOR.to_string(),
            head: Mutex::new(ChainHead::default()),
        }
    }

    /// Compliance retention applied to checkpoint objects.
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = retention_for(&self.storage, days);
        self
    }

    /// Actor recorded on `CHECKPOINT_CREATED` entries.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn public_key_hex(&self) -> String {
        self.signer.public_key_hex()
    }

    /// Creates a checkpoint over every pending leaf. Returns `None` when
    /// nothing was recorded since the previous checkpoint.
    pub async fn run_once(&self) -> Result<Option<Checkpoint>> {
        let mut head = self.head.lock().await;

        let pending = self.ledger.pending_leaves().await;
        let Some(through_sequence) = pending.last().map(|leaf| leaf.sequence) else {
            debug!("No pending evidence, skipping checkpoint");
            return Ok(None);
        };

        let _timer = checkpoint_timer();
        if !head.recovered {
            head.last_id = self.recover_last_id().await?;
            head.recovered = true;
        }

        let leaves: Vec<String> = pending.into_iter().map(|leaf| leaf.leaf_hash).collect();
        let root = merkle_root(&leaves)?;
        let timestamp = Utc::now().trunc_subsecs(6);
        let signature = self
            .signer
            .sign(&signing_message(&root, &timestamp, head.last_id.as_deref()))?;

        let checkpoint = Checkpoint {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            merkle_root: root,
            event_count: leaves.len() as u64,
            previous_checkpoint: head.last_id.clone(),
            signature,
        };

        let storage_key = checkpoint.storage_key();
        let mut options = StoreOptions::new().with_content_type("application/json");
        if let Some(retention) = self.retention {
            options = options.with_retention(retention);
        }
        self.storage
            .store(&storage_key, serde_json::to_vec(&checkpoint)?, options)
            .await?;

        let appended = self
            .ledger
            .append(
                AuditEvent::CheckpointCreated,
                &self.actor,
                json!({
                    "checkpoint_id": checkpoint.checkpoint_id,
                    "merkle_root": checkpoint.merkle_root,
                    "event_count": checkpoint.event_count,
                    "through_sequence": through_sequence,
                    "previous_checkpoint": checkpoint.previous_checkpoint,
                    "storage_key": storage_key,
                }),
            )
            .await;
        if let Err(e) = appended {
            // The leaves stay pending and the next run covers them again.
            error!(
                checkpoint_id = %checkpoint.checkpoint_id,
                error = %e,
                "Checkpoint persisted but its ledger entry was not"
            );
            return Err(e);
        }

        self.ledger.acknowledge(through_sequence).await;
        head.last_id = Some(checkpoint.checkpoint_id.clone());

        observability::record_checkpoint(leaves.len());
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            merkle_root = %checkpoint.merkle_root,
            event_count = checkpoint.event_count,
            previous = ?checkpoint.previous_checkpoint,
            "Checkpoint created"
        );
        Ok(Some(checkpoint))
    }

    /// Loads a persisted checkpoint.
    pub async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let key = format!("{}{}.json", CHECKPOINT_PREFIX, checkpoint_id);
        let retrieved = self.storage.retrieve(&key).await?;
        if !retrieved.matches_recorded_hash() {
            return Err(VaultError::CheckpointInvalid(format!(
                "stored bytes of {} do not match their recorded hash",
                checkpoint_id
            )));
        }
        serde_json::from_slice(&retrieved.data)
            .map_err(|e| VaultError::CheckpointInvalid(format!("{}: {}", checkpoint_id, e)))
    }

    /// Every checkpoint recorded in the ledger, oldest first.
    ///
    /// Only checkpoints with a `CHECKPOINT_CREATED` entry are part of the
    /// chain. A run whose ledger append failed leaves its object behind in
    /// storage; those are reported by [`Self::orphaned`] instead.
    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for entry in self.ledger.entries().await? {
            if entry.event != AuditEvent::CheckpointCreated {
                continue;
            }
            let Some(id) = entry.details.get("checkpoint_id").and_then(Value::as_str) else {
                return Err(VaultError::CheckpointInvalid(format!(
                    "ledger entry {} names no checkpoint",
                    entry.id
                )));
            };
            let checkpoint = self.load(id).await.map_err(|e| match e {
                VaultError::Storage(StorageError::NotFound(_)) => VaultError::CheckpointInvalid(format!(
                    "{} is recorded in the ledger but missing from storage",
                    id
                )),
                other => other,
            })?;
            let recorded_root = entry.details.get("merkle_root").and_then(Value::as_str);
            if recorded_root != Some(checkpoint.merkle_root.as_str()) {
                return Err(VaultError::CheckpointInvalid(format!(
                    "{} does not carry the root recorded in the ledger",
                    id
                )));
            }
            checkpoints.push(checkpoint);
        }
        Ok(checkpoints)
    }

    /// Ids of persisted checkpoint objects that no ledger entry records.
    pub async fn orphaned(&self) -> Result<Vec<String>> {
        let recorded: HashSet<String> = self
            .ledger
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.event == AuditEvent::CheckpointCreated)
            .filter_map(|e| e.details.get("checkpoint_id").and_then(Value::as_str).map(str::to_string))
            .collect();

        let keys = self.storage.list(CHECKPOINT_PREFIX, Some(usize::MAX)).await?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                key.strip_prefix(CHECKPOINT_PREFIX)
                    .and_then(|rest| rest.strip_suffix(".json"))
            })
            .filter(|id| !recorded.contains(*id))
            .map(str::to_string)
            .collect())
    }

    /// The leaves a checkpoint was built from, in tree order, read back
    /// from the ledger.
    pub async fn leaves_for(&self, checkpoint_id: &str) -> Result<Vec<String>> {
        let mut leaves = Vec::new();
        for entry in self.ledger.entries().await? {
            if let Some(leaf) = entry.leaf_hash() {
                leaves.push(leaf.to_string());
                continue;
            }
            if entry.event != AuditEvent::CheckpointCreated {
                continue;
            }
            if entry.details.get("checkpoint_id").and_then(Value::as_str) == Some(checkpoint_id) {
                let count = entry
                    .details
                    .get("event_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                // Leaves recorded after the checkpoint's snapshot belong to the next one.
                leaves.truncate(count.min(leaves.len()));
                return Ok(leaves);
            }
            let covered = entry
                .details
                .get("event_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            leaves.drain(..covered.min(leaves.len()));
        }
        Err(StorageError::NotFound(format!("checkpoint {}", checkpoint_id)).into())
    }

    async fn recover_last_id(&self) -> Result<Option<String>> {
        let last = self.ledger.last_checkpoint_entry().await?;
        Ok(last.and_then(|entry| {
            entry
                .details
                .get("checkpoint_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        }))
    }
}

fn retention_for(storage: &EvidenceStorage, days: u32) -> Option<RetentionPolicy> {
    if storage.capabilities().supports_worm {
        Some(RetentionPolicy::compliance(days))
    } else {
        warn!(
            provider = %storage.capabilities().provider_name,
            "Backend cannot enforce WORM; checkpoints are stored without retention"
        );
        None
    }
}

/// Checks a checkpoint against the leaves it claims to cover and the
/// signer's public key (hex, uncompressed SEC1).
pub fn verify_checkpoint(checkpoint: &Checkpoint, leaves: &[String], public_key_hex: &str) -> Result<()> {
    let invalid = |reason: String| {
        error!(checkpoint_id = %checkpoint.checkpoint_id, reason = %reason, "Checkpoint verification failed");
        VaultError::CheckpointInvalid(format!("{}: {}", checkpoint.checkpoint_id, reason))
    };

    if checkpoint.event_count != leaves.len() as u64 {
        return Err(invalid(format!(
            "event count {} but {} leaves supplied",
            checkpoint.event_count,
            leaves.len()
        )));
    }
    let root = merkle_root(leaves)?;
    if root != checkpoint.merkle_root {
        return Err(invalid("leaves do not hash to the recorded root".to_string()));
    }
    if !verify_signature(public_key_hex, &checkpoint.signing_message(), &checkpoint.signature) {
        return Err(invalid("signature does not verify".to_string()));
    }
    Ok(())
}

/// Checks that checkpoints, oldest first, form one unbroken chain starting
/// at a first checkpoint with no predecessor.
pub fn verify_checkpoint_chain(checkpoints: &[Checkpoint]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut previous: Option<&Checkpoint> = None;
    for checkpoint in checkpoints {
        let expected = previous.map(|p| p.checkpoint_id.as_str());
        if checkpoint.previous_checkpoint.as_deref() != expected {
            error!(
                checkpoint_id = %checkpoint.checkpoint_id,
                expected = ?expected,
                found = ?checkpoint.previous_checkpoint,
                "Checkpoint chain broken"
            );
            return Err(VaultError::CheckpointInvalid(format!(
                "{} links to {:?}, expected {:?}",
                checkpoint.checkpoint_id, checkpoint.previous_checkpoint, expected
            )));
        }
        if !seen.insert(checkpoint.checkpoint_id.as_str()) {
            return Err(VaultError::CheckpointInvalid(format!(
                "duplicate checkpoint {}",
                checkpoint.checkpoint_id
            )));
        }
        if let Some(p) = previous {
            if checkpoint.timestamp < p.timestamp {
                return Err(VaultError::CheckpointInvalid(format!(
                    "{} predates its predecessor",
                    checkpoint.checkpoint_id
                )));
            }
        }
        previous = Some(checkpoint);
    }
    Ok(())
}
