//! Evidence Vault - tamper-evident WORM storage for compliance evidence.
//!
//! Evidence Vault stores artifacts tied to regulatory controls immutably for
//! their mandated retention period and keeps an independently verifiable
//! record of every operation performed on them.
//!
//! # Features
//!
//! - **Uniform WORM storage**: one façade over object-lock, immutable-blob,
//!   relational and archive backends, with a shared six-kind error taxonomy.
//! - **Hash-chained audit ledger**: every operation is an append-only entry
//!   whose hash covers its predecessor.
//! - **Signed checkpoints**: periodic Merkle roots over submitted evidence,
//!   signed with ECDSA P-256 and chained to each other.
//! - **Retention and legal hold**: compliance retention only ever moves
//!   later; a legal hold blocks deletion regardless of expiry.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EvidenceVault                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Checkpoint Engine: Merkle | ECDSA P-256 | Scheduler        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Audit Ledger: Hash Chain | Ledger Store                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage Façade: Retention Engine | Error Taxonomy          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backends: Object Lock | Immutable Blob | SQLite | Archive  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use evidence_vault::config::VaultConfig;
//! use evidence_vault::storage::StorageBuilder;
//! use evidence_vault::{EvidenceSubmission, EvidenceVault};
//!
//! #[tokio::main]
//! async fn main() -> evidence_vault::Result<()> {
//!     let config = VaultConfig::development();
//!     evidence_vault::observability::init(&config.logging)?;
//!
//!     let vault = EvidenceVault::open(&config, StorageBuilder::new()).await?;
//!     vault
//!         .submit_evidence(
//!             "soc2/2024/access-review.pdf",
//!             b"%PDF-1.7 ...".to_vec(),
//!             EvidenceSubmission::for_control("CC6.1"),
//!             "alice@example.com",
//!         )
//!         .await?;
//!     vault.run_checkpoint().await?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod observability;
pub mod retention;
pub mod shutdown;
pub mod storage;
pub mod vault;

// Re-exports
pub use checkpoint::{Checkpoint, CheckpointEngine, CheckpointScheduler, CheckpointSigner};
pub use error::{ErrorKind, Result, StorageError, StorageResult, VaultError};
pub use ledger::{AuditEntry, AuditEvent, AuditLedger};
pub use retention::{RetentionMode, RetentionPolicy};
pub use storage::{EvidenceStorage, StorageCapabilities};
pub use vault::{EvidenceProof, EvidenceSubmission, EvidenceVault, SubmittedEvidence};
