//! The evidence vault: storage, audit ledger and checkpoints wired together.
//!
//! Every operation that touches evidence goes through the façade first and
//! is then recorded in the ledger. Submissions also contribute a Merkle leaf
//! that the next checkpoint commits to.

use crate::checkpoint::{
    build_proof, verify_checkpoint, verify_checkpoint_chain, verify_proof, Checkpoint,
    CheckpointEngine, CheckpointScheduler, CheckpointSigner, InclusionProof, CHECKPOINT_PREFIX,
};
use crate::config::VaultConfig;
use crate::error::{Result, StorageError, VaultError};
use crate::hash::{canonical_timestamp, evidence_leaf_hash, sha256_hex};
use crate::ledger::{AuditEntry, AuditEvent, AuditLedger, StorageLedgerStore, AUDIT_PREFIX};
use crate::observability::{self, AlertSink, LogAlertSink, TamperAlert, TamperKind};
use crate::retention::{AppliedRetention, RetentionPolicy};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{
    EvidenceStorage, RetrievedObject, StorageBuilder, StorageCapabilities, StoreOptions,
    StoredObject,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(3600);

/// What a caller supplies alongside evidence bytes.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSubmission {
    /// Regulatory control the evidence supports.
    pub control_id: String,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Overrides the vault's default retention.
    pub retention: Option<RetentionPolicy>,
}

impl EvidenceSubmission {
    pub fn for_control(control_id: impl Into<String>) -> Self {
        Self {
            control_id: control_id.into(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = Some(retention);
        self
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmittedEvidence {
    pub stored: StoredObject,
    pub leaf_hash: String,
    pub audit_entry: AuditEntry,
}

/// Proof that one evidence item is covered by a signed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceProof {
    pub key: String,
    pub checkpoint: Checkpoint,
    pub proof: InclusionProof,
}

impl EvidenceProof {
    /// True if the proof is for a tree the size of the checkpoint and leads
    /// to its root.
    pub fn verify(&self) -> bool {
        self.proof.leaf_count as u64 == self.checkpoint.event_count
            && verify_proof(&self.proof, &self.checkpoint.merkle_root)
    }
}

pub struct EvidenceVault {
    storage: EvidenceStorage,
    ledger: Arc<AuditLedger>,
    checkpoints: Arc<CheckpointEngine>,
    alerts: Arc<dyn AlertSink>,
    default_retention: Option<RetentionPolicy>,
    checkpoint_interval: Duration,
    // Keys with a submission between store and ledger append.
    in_flight: Mutex<HashSet<String>>,
}

impl EvidenceVault {
    /// Opens the configured backend, restores the ledger from it and loads
    /// (or generates) the checkpoint signing key.
    pub async fn open(config: &VaultConfig, builder: StorageBuilder) -> Result<Self> {
        config.validate()?;
        let storage = builder.build(config).await?;

        let signer = match &config.checkpoint.signing_key_path {
            Some(path) => CheckpointSigner::load(path)?,
            None => {
                warn!("No signing key configured, generating an ephemeral checkpoint key");
                CheckpointSigner::generate()?
            }
        };

        let mut ledger_store = StorageLedgerStore::new(storage.clone());
        if storage.capabilities().supports_worm {
            ledger_store = ledger_store
                .with_retention(RetentionPolicy::compliance(config.checkpoint.retention_days));
        }
        let ledger = Arc::new(AuditLedger::open(Arc::new(ledger_store)).await?);

        let engine = CheckpointEngine::new(storage.clone(), ledger.clone(), signer)
            .with_retention_days(config.checkpoint.retention_days)
            .with_actor(config.checkpoint.actor.clone());

        Ok(Self::from_parts(storage, ledger, engine)
            .with_default_retention(config.retention.policy())
            .with_checkpoint_interval(config.checkpoint.interval))
    }

    /// Assembles a vault from already constructed components. No default
    /// retention is applied until [`Self::with_default_retention`].
    pub fn from_parts(
        storage: EvidenceStorage,
        ledger: Arc<AuditLedger>,
        checkpoints: CheckpointEngine,
    ) -> Self {
        Self {
            storage,
            ledger,
            checkpoints: Arc::new(checkpoints),
            alerts: Arc::new(LogAlertSink),
            default_retention: None,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Retention applied to submissions that do not carry their own. Only
    /// takes effect on backends that enforce WORM.
    pub fn with_default_retention(mut self, policy: RetentionPolicy) -> Self {
        if self.storage.capabilities().supports_worm {
            self.default_retention = Some(policy);
        } else {
            warn!(
                provider = %self.storage.capabilities().provider_name,
                "Backend cannot enforce WORM; evidence is stored without default retention"
            );
            self.default_retention = None;
        }
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn storage(&self) -> &EvidenceStorage {
        &self.storage
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointEngine> {
        &self.checkpoints
    }

    pub fn capabilities(&self) -> &StorageCapabilities {
        self.storage.capabilities()
    }

    /// Hex public key that verifies this vault's checkpoints.
    pub fn public_key_hex(&self) -> String {
        self.checkpoints.public_key_hex()
    }

    pub async fn health_check(&self) -> bool {
        self.storage.health_check().await
    }

    /// Stores evidence immutably and records `EVIDENCE_SUBMITTED` with the
    /// Merkle leaf derived from it.
    ///
    /// If an earlier submission stored the object but failed to record it,
    /// resubmitting the same bytes records it instead of failing
    /// `ALREADY_EXISTS`.
    pub async fn submit_evidence(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        submission: EvidenceSubmission,
        actor: &str,
    ) -> Result<SubmittedEvidence> {
        check_namespace(key)?;

        let mut options = StoreOptions::new();
        options.metadata = submission.metadata;
        options.content_type = submission.content_type;
        options
            .metadata
            .insert("control_id".to_string(), submission.control_id.clone());
        if let Some(retention) = submission.retention.or(self.default_retention) {
            options = options.with_retention(retention);
        }

        let data: Bytes = data.into();
        let claim = SubmissionClaim::acquire(&self.in_flight, key);
        let stored = match self.storage.store(key, data.clone(), options).await {
            Ok(stored) => stored,
            Err(StorageError::AlreadyExists(reason)) => {
                let unrecorded = if claim.owned {
                    self.unrecorded_submission(key, &data).await?
                } else {
                    None
                };
                match unrecorded {
                    Some(stored) => {
                        warn!(key = %key, "Recording evidence stored by an earlier submission that never reached the ledger");
                        stored
                    }
                    None => return Err(StorageError::AlreadyExists(reason).into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        let leaf_hash = evidence_leaf_hash(key, &stored.content_hash, &stored.stored_at);

        let details = json!({
            "key": key,
            "control_id": submission.control_id,
            "content_hash": stored.content_hash,
            "size": stored.size,
            "stored_at": canonical_timestamp(&stored.stored_at),
            "retention": stored.retention,
            "leaf_hash": leaf_hash,
        });
        let audit_entry = match self
            .ledger
            .append(AuditEvent::EvidenceSubmitted, actor, details)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                // The object has landed; resubmitting the same bytes records it.
                error!(key = %key, error = %e, "Evidence stored but not recorded in the audit ledger");
                return Err(e);
            }
        };

        info!(
            key = %key,
            control_id = %submission.control_id,
            actor = %actor,
            hash = %stored.content_hash,
            "Evidence submitted"
        );
        Ok(SubmittedEvidence {
            stored,
            leaf_hash,
            audit_entry,
        })
    }

    /// Reads evidence and records the access. A hash mismatch on the way out
    /// is recorded as a violation but the bytes are still returned.
    pub async fn retrieve_evidence(&self, key: &str, actor: &str) -> Result<RetrievedObject> {
        let retrieved = self.storage.retrieve(key).await?;
        self.ledger
            .append(
                AuditEvent::EvidenceAccessed,
                actor,
                json!({"key": key, "content_hash": retrieved.computed_hash}),
            )
            .await?;
        if !retrieved.matches_recorded_hash() {
            self.record_violation(key, &retrieved, actor).await?;
        }
        Ok(retrieved)
    }

    /// Recomputes the hash of stored bytes and compares it with the hash
    /// recorded at store time.
    pub async fn verify_evidence(&self, key: &str, actor: &str) -> Result<bool> {
        let retrieved = self.storage.retrieve(key).await?;
        if retrieved.matches_recorded_hash() {
            self.ledger
                .append(
                    AuditEvent::IntegrityVerified,
                    actor,
                    json!({"key": key, "content_hash": retrieved.computed_hash}),
                )
                .await?;
            Ok(true)
        } else {
            self.record_violation(key, &retrieved, actor).await?;
            Ok(false)
        }
    }

    /// The stored object under `key` if it holds exactly `data` and no
    /// `EVIDENCE_SUBMITTED` entry records it.
    async fn unrecorded_submission(&self, key: &str, data: &Bytes) -> Result<Option<StoredObject>> {
        let recorded = self
            .ledger
            .entries_for_key(key)
            .await?
            .iter()
            .any(|e| e.event == AuditEvent::EvidenceSubmitted);
        if recorded {
            return Ok(None);
        }
        let metadata = self.storage.metadata(key).await?;
        let content_hash = sha256_hex(data);
        if metadata.content_hash.as_deref() != Some(content_hash.as_str()) {
            return Ok(None);
        }
        Ok(Some(StoredObject {
            key: key.to_string(),
            content_hash,
            size: metadata.size,
            stored_at: metadata.stored_at,
            retention: metadata.retention,
            provider_metadata: metadata.provider_metadata,
        }))
    }

    async fn record_violation(&self, key: &str, retrieved: &RetrievedObject, actor: &str) -> Result<()> {
        let recorded = retrieved.metadata.content_hash.as_deref().unwrap_or("<missing>");
        self.raise(TamperAlert::new(
            TamperKind::ContentHash,
            key,
            format!("recorded {} but stored bytes hash to {}", recorded, retrieved.computed_hash),
        ));
        self.ledger
            .append(
                AuditEvent::IntegrityViolation,
                actor,
                json!({
                    "key": key,
                    "recorded_hash": retrieved.metadata.content_hash,
                    "computed_hash": retrieved.computed_hash,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn apply_legal_hold(&self, key: &str, actor: &str, reason: &str) -> Result<()> {
        self.storage.apply_legal_hold(key).await?;
        self.ledger
            .append(AuditEvent::LegalHoldApplied, actor, json!({"key": key, "reason": reason}))
            .await?;
        Ok(())
    }

    pub async fn remove_legal_hold(&self, key: &str, actor: &str, reason: &str) -> Result<()> {
        self.storage.remove_legal_hold(key).await?;
        self.ledger
            .append(AuditEvent::LegalHoldRemoved, actor, json!({"key": key, "reason": reason}))
            .await?;
        Ok(())
    }

    /// Moves an object's retention. Compliance retention only ever moves
    /// later; governance retention may be shortened with `bypass_governance`.
    pub async fn extend_retention(
        &self,
        key: &str,
        policy: RetentionPolicy,
        bypass_governance: bool,
        actor: &str,
    ) -> Result<AppliedRetention> {
        let applied = self
            .storage
            .extend_retention(key, policy, bypass_governance)
            .await?;
        self.ledger
            .append(
                AuditEvent::RetentionExtended,
                actor,
                json!({
                    "key": key,
                    "mode": applied.mode,
                    "retention_days": policy.retention_days,
                    "retain_until": canonical_timestamp(&applied.retain_until),
                    "bypass_governance": bypass_governance,
                }),
            )
            .await?;
        Ok(applied)
    }

    /// Deletes evidence whose retention has lapsed and that is not on hold.
    pub async fn delete_evidence(&self, key: &str, actor: &str) -> Result<()> {
        check_namespace(key)?;
        self.storage.delete(key).await?;
        self.ledger
            .append(AuditEvent::EvidenceDeleted, actor, json!({"key": key}))
            .await?;
        Ok(())
    }

    /// Walks the whole audit chain. A break raises a tamper alert and is
    /// returned as an error; success is itself recorded.
    pub async fn verify_audit_chain(&self, actor: &str) -> Result<u64> {
        match self.ledger.verify_chain().await {
            Ok(count) => {
                self.ledger
                    .append(
                        AuditEvent::ChainVerified,
                        actor,
                        json!({"entries_verified": count}),
                    )
                    .await?;
                info!(entries = count, "Audit chain verified");
                Ok(count)
            }
            Err(e) => {
                if let VaultError::ChainBroken {
                    position,
                    entry_id,
                    reason,
                } = &e
                {
                    self.raise(TamperAlert::new(
                        TamperKind::AuditChain,
                        entry_id.clone(),
                        format!("position {}: {}", position, reason),
                    ));
                }
                Err(e)
            }
        }
    }

    /// Verifies every checkpoint the ledger records: the chain of links,
    /// each root against the ledger's leaves, and each signature against
    /// this vault's key. Returns the number of checkpoints checked.
    pub async fn verify_checkpoints(&self) -> Result<usize> {
        let public_key = self.public_key_hex();

        let result = async {
            let checkpoints = self.checkpoints.list().await?;
            verify_checkpoint_chain(&checkpoints)?;
            for checkpoint in &checkpoints {
                let leaves = self.checkpoints.leaves_for(&checkpoint.checkpoint_id).await?;
                verify_checkpoint(checkpoint, &leaves, &public_key)?;
            }
            Ok::<_, VaultError>(checkpoints.len())
        }
        .await;

        if let Err(VaultError::CheckpointInvalid(reason)) = &result {
            self.raise(TamperAlert::new(TamperKind::Checkpoint, "checkpoints", reason.clone()));
        }
        if result.is_ok() {
            let orphans = self.checkpoints.orphaned().await?;
            if !orphans.is_empty() {
                warn!(count = orphans.len(), ids = ?orphans, "Checkpoint objects with no ledger entry");
            }
        }
        result
    }

    /// Checkpoint objects left in storage by runs whose ledger entry was
    /// never written. They are outside the chain and signed over leaves a
    /// later checkpoint covers again.
    pub async fn orphaned_checkpoints(&self) -> Result<Vec<String>> {
        self.checkpoints.orphaned().await
    }

    /// Inclusion proof tying `key` to the checkpoint that covers it, or
    /// `None` if no checkpoint has covered it yet.
    pub async fn prove_evidence(&self, key: &str) -> Result<Option<EvidenceProof>> {
        let submitted = self
            .ledger
            .entries_for_key(key)
            .await?
            .into_iter()
            .rev()
            .find(|e| e.event == AuditEvent::EvidenceSubmitted)
            .ok_or_else(|| StorageError::NotFound(format!("no submission recorded for {}", key)))?;
        let Some(leaf) = submitted.leaf_hash().map(str::to_string) else {
            return Ok(None);
        };

        for checkpoint in self.checkpoints.list().await? {
            let leaves = self.checkpoints.leaves_for(&checkpoint.checkpoint_id).await?;
            if let Some(index) = leaves.iter().position(|l| *l == leaf) {
                let proof = build_proof(&leaves, index)?;
                return Ok(Some(EvidenceProof {
                    key: key.to_string(),
                    checkpoint,
                    proof,
                }));
            }
        }
        Ok(None)
    }

    pub async fn run_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.checkpoints.run_once().await
    }

    /// Starts periodic checkpointing at the configured interval.
    pub fn start_checkpoint_scheduler(&self, shutdown: ShutdownCoordinator) -> CheckpointScheduler {
        CheckpointScheduler::spawn(self.checkpoints.clone(), self.checkpoint_interval, shutdown)
    }

    fn raise(&self, alert: TamperAlert) {
        observability::record_tamper_alert(alert.kind.as_str());
        self.alerts.raise(&alert);
    }
}

/// Marks a key as mid-submission. Only the owner of the claim may record an
/// object it finds already stored, so a concurrent duplicate never records
/// the same evidence twice.
struct SubmissionClaim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    key: String,
    owned: bool,
}

impl<'a> SubmissionClaim<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<String>>, key: &str) -> Self {
        let owned = in_flight.lock().insert(key.to_string());
        Self {
            in_flight,
            key: key.to_string(),
            owned,
        }
    }
}

impl Drop for SubmissionClaim<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.in_flight.lock().remove(&self.key);
        }
    }
}

/// Ledger entries and checkpoints share the evidence namespace.
fn check_namespace(key: &str) -> Result<()> {
    if key.starts_with(AUDIT_PREFIX) || key.starts_with(CHECKPOINT_PREFIX) {
        return Err(StorageError::PermissionDenied(format!("{} is in a reserved namespace", key)).into());
    }
    Ok(())
}
