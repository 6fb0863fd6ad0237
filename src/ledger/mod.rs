//! Append-only, hash-chained audit ledger.
//!
//! Every security-relevant event becomes an [`AuditEntry`] whose
//! `current_hash` commits to the previous entry's hash and to its own
//! contents. Editing any entry anywhere in history breaks every hash after
//! it, which [`AuditLedger::verify_chain`] detects without a trusted third
//! party.
//!
//! Appends are strictly serialized. Readers go straight to the
//! [`LedgerStore`] and may observe a prefix of the chain, never blocking a
//! writer.

pub mod chain;
pub mod entry;
pub mod store;

pub use chain::{verify_entries, AuditLedger, PendingLeaf};
pub use entry::{AuditEntry, AuditEvent, GENESIS_HASH};
pub use store::{LedgerStore, MemoryLedgerStore, StorageLedgerStore, AUDIT_PREFIX};
