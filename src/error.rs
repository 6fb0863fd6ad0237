//! Error types for the evidence vault.
//!
//! Two layers are exposed:
//!
//! - [`StorageError`] is the shared storage taxonomy. Every backend-native
//!   failure (HTTP status codes, service error codes, I/O errors, SQLite
//!   failures, timeouts) is mapped into exactly one of its six variants at the
//!   adapter boundary; see [`crate::storage::error_map`].
//! - [`VaultError`] is the crate-wide error. It wraps storage failures and adds
//!   the ledger, checkpoint, signing and configuration failures.
//!
//! # Example
//!
//! ```rust
//! use evidence_vault::error::{ErrorKind, StorageError};
//!
//! fn handle(err: &StorageError) {
//!     match err.kind() {
//!         ErrorKind::AlreadyExists => println!("evidence already recorded"),
//!         ErrorKind::ConnectionFailed => println!("retry with backoff"),
//!         _ => println!("fatal: {}", err),
//!     }
//! }
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

/// Shared vocabulary for storage failures, independent of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ConnectionFailed,
    NotSupported,
    Unknown,
}

impl ErrorKind {
    /// Wire code of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ErrorKind::NotSupported => "NOT_SUPPORTED",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Storage failure after mapping into the shared taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Unknown storage error: {0}")]
    Unknown(String),
}

impl StorageError {
    /// Taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            StorageError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            StorageError::NotSupported(_) => ErrorKind::NotSupported,
            StorageError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Wire code, e.g. `"ALREADY_EXISTS"`.
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Only connection failures are worth retrying; the core never retries
    /// internally, callers apply their own backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::ConnectionFailed(_))
    }

    /// Build an error of the given kind.
    pub fn of_kind(kind: ErrorKind, context: impl Into<String>) -> Self {
        let context = context.into();
        match kind {
            ErrorKind::NotFound => StorageError::NotFound(context),
            ErrorKind::AlreadyExists => StorageError::AlreadyExists(context),
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(context),
            ErrorKind::ConnectionFailed => StorageError::ConnectionFailed(context),
            ErrorKind::NotSupported => StorageError::NotSupported(context),
            ErrorKind::Unknown => StorageError::Unknown(context),
        }
    }
}

/// Main error type for vault operations.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    // Ledger errors
    #[error("Audit chain broken at position {position} (entry {entry_id}): {reason}")]
    ChainBroken {
        position: u64,
        entry_id: String,
        reason: String,
    },

    // Checkpoint errors
    #[error("Checkpoint verification failed: {0}")]
    CheckpointInvalid(String),

    #[error("Signing error: {0}")]
    Signing(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl VaultError {
    /// Storage taxonomy kind, if this is a storage failure.
    pub fn storage_kind(&self) -> Option<ErrorKind> {
        match self {
            VaultError::Storage(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// True for failures that indicate possible tampering. These must reach
    /// an operator and are never downgraded to warnings.
    pub fn is_tamper_evidence(&self) -> bool {
        matches!(
            self,
            VaultError::ChainBroken { .. } | VaultError::CheckpointInvalid(_)
        )
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Storage(e) if e.is_retryable())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Result type alias for storage façade and adapter operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
