//! Error taxonomy mapper.
//!
//! Adapters surface whatever their medium reports as a [`NativeError`] and
//! convert it here, at the adapter boundary, into exactly one
//! [`StorageError`] variant. Nothing above the adapters ever sees a native
//! shape.

use crate::error::{ErrorKind, StorageError};
use rusqlite::ErrorCode;
use std::fmt;
use std::io;
use std::time::Duration;

/// A backend-native failure before mapping.
#[derive(Debug)]
pub enum NativeError {
    /// HTTP-style service failure: status plus optional service error code.
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// Local or network I/O failure.
    Io(io::Error),
    /// SQLite failure from the relational backend.
    Sqlite(rusqlite::Error),
    /// The medium did not answer in time.
    Timeout(Duration),
    /// Transport-level failure (DNS, TLS, connection reset).
    Transport(String),
    /// The medium lacks a capability the request needs.
    Capability(String),
}

impl NativeError {
    pub fn http(status: u16, code: &str, message: impl Into<String>) -> Self {
        NativeError::Http {
            status,
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// Taxonomy kind this native error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NativeError::Http { status, code, .. } => code
                .as_deref()
                .and_then(kind_for_service_code)
                .unwrap_or_else(|| kind_for_status(*status)),
            NativeError::Io(e) => kind_for_io(e),
            NativeError::Sqlite(e) => kind_for_sqlite(e),
            NativeError::Timeout(_) | NativeError::Transport(_) => ErrorKind::ConnectionFailed,
            NativeError::Capability(_) => ErrorKind::NotSupported,
        }
    }

    /// Maps into the shared taxonomy, keeping the native detail as context.
    pub fn into_storage(self, context: &str) -> StorageError {
        let kind = self.kind();
        StorageError::of_kind(kind, format!("{}: {}", context, self))
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeError::Http {
                status,
                code: Some(code),
                message,
            } => write!(f, "HTTP {} {}: {}", status, code, message),
            NativeError::Http {
                status, message, ..
            } => write!(f, "HTTP {}: {}", status, message),
            NativeError::Io(e) => write!(f, "io: {}", e),
            NativeError::Sqlite(e) => write!(f, "sqlite: {}", e),
            NativeError::Timeout(d) => write!(f, "timed out after {:?}", d),
            NativeError::Transport(msg) => write!(f, "transport: {}", msg),
            NativeError::Capability(msg) => write!(f, "capability: {}", msg),
        }
    }
}

impl From<io::Error> for NativeError {
    fn from(e: io::Error) -> Self {
        NativeError::Io(e)
    }
}

impl From<rusqlite::Error> for NativeError {
    fn from(e: rusqlite::Error) -> Self {
        NativeError::Sqlite(e)
    }
}

/// Service error codes of the object-lock and blob media.
fn kind_for_service_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "NoSuchKey" | "NoSuchBucket" | "NotFound" | "BlobNotFound" | "ContainerNotFound"
        | "NoSuchObjectLockConfiguration" => ErrorKind::NotFound,
        "BlobAlreadyExists" | "PreconditionFailed" | "ConditionNotMet" => ErrorKind::AlreadyExists,
        "AccessDenied" | "AuthorizationFailure" | "AuthenticationFailed"
        | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "BlobImmutableDueToPolicy"
        | "BlobImmutableDueToLegalHold" | "ImmutabilityPolicyCannotBeShortened" => {
            ErrorKind::PermissionDenied
        }
        "NotImplemented" | "ObjectLockConfigurationNotFoundError"
        | "FeatureVersionMismatch" | "InvalidBucketState" => ErrorKind::NotSupported,
        "RequestTimeout" | "SlowDown" | "ServiceUnavailable" | "ServerBusy"
        | "OperationTimedOut" => ErrorKind::ConnectionFailed,
        _ => return None,
    };
    Some(kind)
}

fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        409 | 412 => ErrorKind::AlreadyExists,
        501 => ErrorKind::NotSupported,
        408 | 429 | 502 | 503 | 504 => ErrorKind::ConnectionFailed,
        _ => ErrorKind::Unknown,
    }
}

fn kind_for_io(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted => ErrorKind::ConnectionFailed,
        io::ErrorKind::Unsupported => ErrorKind::NotSupported,
        _ => ErrorKind::Unknown,
    }
}

fn kind_for_sqlite(e: &rusqlite::Error) -> ErrorKind {
    match e {
        rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::ConstraintViolation => ErrorKind::AlreadyExists,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                ErrorKind::ConnectionFailed
            }
            ErrorCode::ReadOnly
            | ErrorCode::PermissionDenied
            | ErrorCode::AuthorizationForStatementDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Unknown,
        },
        _ => ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_code_wins_over_status() {
        // A 409 from the blob medium for a locked policy is a permission
        // failure, not a duplicate.
        let err = NativeError::http(409, "ImmutabilityPolicyCannotBeShortened", "locked");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = NativeError::http(409, "BlobAlreadyExists", "exists");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_status_fallback() {
        let mk = |status| NativeError::Http {
            status,
            code: None,
            message: String::new(),
        };
        assert_eq!(mk(404).kind(), ErrorKind::NotFound);
        assert_eq!(mk(403).kind(), ErrorKind::PermissionDenied);
        assert_eq!(mk(409).kind(), ErrorKind::AlreadyExists);
        assert_eq!(mk(503).kind(), ErrorKind::ConnectionFailed);
        assert_eq!(mk(501).kind(), ErrorKind::NotSupported);
        assert_eq!(mk(500).kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_io_mapping() {
        let err = NativeError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        let err = NativeError::from(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_sqlite_mapping() {
        assert_eq!(
            NativeError::from(rusqlite::Error::QueryReturnedNoRows).kind(),
            ErrorKind::NotFound
        );
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert_eq!(NativeError::from(constraint).kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_into_storage_keeps_context() {
        let err = NativeError::Timeout(Duration::from_secs(5)).into_storage("put evidence/a");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("evidence/a"));
        assert_eq!(
            NativeError::Capability("no hold".into()).into_storage("hold").code(),
            "NOT_SUPPORTED"
        );
    }
}
