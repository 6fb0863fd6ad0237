//! Audit entry shape and canonical hashing.

use crate::hash::{canonical_timestamp, sha256_hex};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// `previousHash` of the first entry: 64 hex zeros.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Event kinds recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    EvidenceSubmitted,
    EvidenceAccessed,
    IntegrityVerified,
    IntegrityViolation,
    LegalHoldApplied,
    LegalHoldRemoved,
    RetentionExtended,
    EvidenceDeleted,
    CheckpointCreated,
    ChainVerified,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::EvidenceSubmitted => "EVIDENCE_SUBMITTED",
            AuditEvent::EvidenceAccessed => "EVIDENCE_ACCESSED",
            AuditEvent::IntegrityVerified => "INTEGRITY_VERIFIED",
            AuditEvent::IntegrityViolation => "INTEGRITY_VIOLATION",
            AuditEvent::LegalHoldApplied => "LEGAL_HOLD_APPLIED",
            AuditEvent::LegalHoldRemoved => "LEGAL_HOLD_REMOVED",
            AuditEvent::RetentionExtended => "RETENTION_EXTENDED",
            AuditEvent::EvidenceDeleted => "EVIDENCE_DELETED",
            AuditEvent::CheckpointCreated => "CHECKPOINT_CREATED",
            AuditEvent::ChainVerified => "CHAIN_VERIFIED",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One link in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    /// Zero-based position in the chain.
    pub sequence: u64,
    pub event: AuditEvent,
    pub actor: String,
    /// Event-specific structured details.
    pub details: Value,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub current_hash: String,
}

impl AuditEntry {
    /// Builds the entry that follows `previous_hash` at `sequence`.
    pub fn new(
        sequence: u64,
        previous_hash: &str,
        event: AuditEvent,
        actor: impl Into<String>,
        details: Value,
    ) -> Self {
        let actor = actor.into();
        // Microseconds survive every storage round trip unchanged.
        let timestamp = Utc::now().trunc_subsecs(6);
        let current_hash = compute_hash(previous_hash, event, &actor, &details, &timestamp);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            event,
            actor,
            details,
            timestamp,
            previous_hash: previous_hash.to_string(),
            current_hash,
        }
    }

    /// Hash of this entry's contents as they are now.
    pub fn recompute_hash(&self) -> String {
        compute_hash(
            &self.previous_hash,
            self.event,
            &self.actor,
            &self.details,
            &self.timestamp,
        )
    }

    /// Evidence key the entry refers to, if any.
    pub fn evidence_key(&self) -> Option<&str> {
        self.details.get("key").and_then(Value::as_str)
    }

    /// Merkle leaf committed by an `EVIDENCE_SUBMITTED` entry.
    pub fn leaf_hash(&self) -> Option<&str> {
        match self.event {
            AuditEvent::EvidenceSubmitted => self.details.get("leaf_hash").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// SHA-256 over the canonical encoding of
/// `[previousHash, event, actor, details, timestamp]`: compact JSON, object
/// keys sorted at every depth, timestamp in RFC 3339 with microseconds.
pub fn compute_hash(
    previous_hash: &str,
    event: AuditEvent,
    actor: &str,
    details: &Value,
    timestamp: &DateTime<Utc>,
) -> String {
    let canonical = json!([
        previous_hash,
        event.as_str(),
        actor,
        canonicalize(details),
        canonical_timestamp(timestamp),
    ]);
    sha256_hex(canonical.to_string().as_bytes())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
