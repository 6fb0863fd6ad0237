//! Relational development backend on SQLite.
//!
//! There is no native WORM here. Retention and legal hold are stored as
//! columns and reported back, but nothing stops a privileged user from
//! editing the table. Capabilities say so.

use super::error_map::NativeError;
use super::types::{NewObject, ObjectMetadata, StorageCapabilities, StoredObject};
use super::StorageBackend;
use crate::error::{Result, StorageError, StorageResult};
use crate::retention::{self, AppliedRetention, RetentionMode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// SQLite BLOB limit with default compile options.
const MAX_ROW_BLOB: u64 = 1_000_000_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS evidence_objects (
    key             TEXT PRIMARY KEY NOT NULL,
    content         BLOB NOT NULL,
    content_hash    TEXT NOT NULL,
    size            INTEGER NOT NULL,
    content_type    TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    stored_at       TEXT NOT NULL,
    retention_mode  TEXT,
    retain_until    TEXT,
    legal_hold      INTEGER NOT NULL DEFAULT 0
);
";

const SELECT_COLUMNS: &str = "key, content_hash, size, content_type, metadata, stored_at, \
                              retention_mode, retain_until, legal_hold";

/// SQLite-backed adapter for development and tests.
pub struct RelationalBackend {
    conn: Arc<Mutex<Connection>>,
    location: String,
}

impl RelationalBackend {
    /// Opens (or creates) the database file and applies the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let path: PathBuf = path.to_path_buf();
        let location = path.display().to_string();
        let conn = tokio::task::spawn_blocking(move || -> StorageResult<Connection> {
            let conn = Connection::open(&path)
                .map_err(|e| NativeError::from(e).into_storage("open database"))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| NativeError::from(e).into_storage("pragma journal_mode"))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| NativeError::from(e).into_storage("apply schema"))?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Unknown(format!("open task failed: {}", e)))??;

        info!(path = %location, "Opened relational evidence store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
        })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| NativeError::from(e).into_storage("open in-memory database"))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| NativeError::from(e).into_storage("apply schema"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location: ":memory:".to_string(),
        })
    }

    /// Overwrites the stored bytes of a row out-of-band, as a privileged
    /// database user could. Returns false if the key is absent.
    pub fn tamper(&self, key: &str, content: &[u8]) -> bool {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE evidence_objects SET content = ?1 WHERE key = ?2",
            params![content, key],
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    async fn with_conn<F, T>(&self, context: String, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, NativeError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let ctx = context.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn).map_err(|e| e.into_storage(&ctx))
        })
        .await
        .map_err(|e| StorageError::Unknown(format!("{}: task failed: {}", context, e)))?
    }

    fn provider_metadata(&self) -> HashMap<String, String> {
        let mut provider = HashMap::new();
        provider.insert("database".to_string(), self.location.clone());
        provider
    }
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, NativeError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("corrupt timestamp '{}': {}", s, e)))
}

struct MetadataRow {
    key: String,
    content_hash: String,
    size: i64,
    content_type: Option<String>,
    metadata: String,
    stored_at: String,
    retention_mode: Option<String>,
    retain_until: Option<String>,
    legal_hold: bool,
}

impl MetadataRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            content_hash: row.get(1)?,
            size: row.get(2)?,
            content_type: row.get(3)?,
            metadata: row.get(4)?,
            stored_at: row.get(5)?,
            retention_mode: row.get(6)?,
            retain_until: row.get(7)?,
            legal_hold: row.get(8)?,
        })
    }

    fn into_metadata(self) -> std::result::Result<ObjectMetadata, NativeError> {
        let retention = match (self.retention_mode, self.retain_until) {
            (Some(mode), Some(until)) => Some(AppliedRetention {
                mode: mode
                    .parse::<RetentionMode>()
                    .map_err(corrupt)?,
                retain_until: parse_ts(&until)?,
            }),
            _ => None,
        };
        let metadata: HashMap<String, String> =
            serde_json::from_str(&self.metadata).unwrap_or_default();

        Ok(ObjectMetadata {
            key: self.key,
            content_hash: Some(self.content_hash),
            size: u64::try_from(self.size).unwrap_or(0),
            stored_at: parse_ts(&self.stored_at)?,
            retention,
            legal_hold: self.legal_hold,
            content_type: self.content_type,
            metadata,
            provider_metadata: HashMap::new(),
        })
    }
}

fn not_found() -> NativeError {
    NativeError::Sqlite(rusqlite::Error::QueryReturnedNoRows)
}

fn corrupt(msg: String) -> NativeError {
    NativeError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            supports_worm: false,
            supports_legal_hold: true,
            supports_retention: false,
            max_object_size: MAX_ROW_BLOB,
            provider_name: "relational".to_string(),
        }
    }

    async fn put(&self, object: NewObject) -> StorageResult<StoredObject> {
        if self.exists(&object.key).await? {
            return Err(StorageError::AlreadyExists(object.key));
        }

        let row = object.clone();
        let context = format!("insert {}", object.key);
        self.with_conn(context, move |conn| {
            let metadata = serde_json::to_string(&row.metadata)
                .map_err(|e| corrupt(e.to_string()))?;
            // The primary key still rejects a racing insert of the same key.
            conn.execute(
                "INSERT INTO evidence_objects \
                 (key, content, content_hash, size, content_type, metadata, stored_at, \
                  retention_mode, retain_until, legal_hold) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
                params![
                    row.key,
                    row.data.as_ref(),
                    row.content_hash,
                    row.size() as i64,
                    row.content_type,
                    metadata,
                    crate::hash::canonical_timestamp(&row.stored_at),
                    row.retention.map(|r| r.mode.to_string()),
                    row.retention.map(|r| crate::hash::canonical_timestamp(&r.retain_until)),
                ],
            )?;
            Ok(())
        })
        .await?;

        debug!(key = %object.key, "Inserted evidence row");
        let provider = self.provider_metadata();
        Ok(object.into_stored(provider))
    }

    async fn get(&self, key: &str) -> StorageResult<(Bytes, ObjectMetadata)> {
        let k = key.to_string();
        let (content, meta) = self
            .with_conn(format!("select {}", key), move |conn| {
                let sql = format!(
                    "SELECT {}, content FROM evidence_objects WHERE key = ?1",
                    SELECT_COLUMNS
                );
                let found = conn
                    .query_row(&sql, params![k], |row| {
                        let content: Vec<u8> = row.get(9)?;
                        Ok((content, MetadataRow::from_row(row)?))
                    })
                    .optional()?;
                let (content, meta) = found.ok_or_else(not_found)?;
                Ok((content, meta.into_metadata()?))
            })
            .await?;

        let mut meta = meta;
        meta.provider_metadata = self.provider_metadata();
        Ok((Bytes::from(content), meta))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let k = key.to_string();
        let mut meta = self
            .with_conn(format!("select {}", key), move |conn| {
                let sql = format!("SELECT {} FROM evidence_objects WHERE key = ?1", SELECT_COLUMNS);
                let row = conn
                    .query_row(&sql, params![k], MetadataRow::from_row)
                    .optional()?
                    .ok_or_else(not_found)?;
                row.into_metadata()
            })
            .await?;
        meta.provider_metadata = self.provider_metadata();
        Ok(meta)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let k = key.to_string();
        self.with_conn(format!("exists {}", key), move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM evidence_objects WHERE key = ?1",
                    params![k],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn list(&self, prefix: &str, limit: usize) -> StorageResult<Vec<String>> {
        let p = prefix.to_string();
        self.with_conn(format!("list {}", prefix), move |conn| {
            // substr comparison avoids LIKE wildcard escaping.
            let mut stmt = conn.prepare(
                "SELECT key FROM evidence_objects \
                 WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key LIMIT ?2",
            )?;
            let keys = stmt
                .query_map(params![p, limit as i64], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn set_legal_hold(&self, key: &str, on: bool) -> StorageResult<()> {
        let k = key.to_string();
        self.with_conn(format!("legal hold {}", key), move |conn| {
            let n = conn.execute(
                "UPDATE evidence_objects SET legal_hold = ?1 WHERE key = ?2",
                params![on, k],
            )?;
            if n == 0 {
                return Err(not_found());
            }
            Ok(())
        })
        .await
    }

    async fn set_retention(
        &self,
        key: &str,
        requested: AppliedRetention,
        bypass_governance: bool,
    ) -> StorageResult<()> {
        let current = self.head(key).await?.retention;
        retention::validate_change(current.as_ref(), &requested, bypass_governance)?;

        let k = key.to_string();
        self.with_conn(format!("retention {}", key), move |conn| {
            conn.execute(
                "UPDATE evidence_objects SET retention_mode = ?1, retain_until = ?2 WHERE key = ?3",
                params![
                    requested.mode.to_string(),
                    crate::hash::canonical_timestamp(&requested.retain_until),
                    k
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let k = key.to_string();
        self.with_conn(format!("delete {}", key), move |conn| {
            let n = conn.execute("DELETE FROM evidence_objects WHERE key = ?1", params![k])?;
            if n == 0 {
                return Err(not_found());
            }
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.with_conn("ping".to_string(), |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256_hex;
    use crate::retention::RetentionPolicy;

    fn new_object(key: &str, body: &'static [u8]) -> NewObject {
        NewObject {
            key: key.to_string(),
            data: Bytes::from_static(body),
            content_hash: sha256_hex(body),
            stored_at: Utc::now(),
            retention: None,
            content_type: Some("text/plain".to_string()),
            metadata: HashMap::from([("control".to_string(), "ctrl-1".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        backend.put(new_object("a/1", b"hello")).await.unwrap();

        let (data, meta) = backend.get("a/1").await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(meta.content_hash.as_deref(), Some(sha256_hex(b"hello").as_str()));
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
        assert_eq!(meta.metadata.get("control").map(String::as_str), Some("ctrl-1"));
        assert!(!meta.legal_hold);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        backend.put(new_object("dup", b"one")).await.unwrap();
        let err = backend.put(new_object("dup", b"two")).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
        assert_eq!(&backend.get("dup").await.unwrap().0[..], b"one");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        assert_eq!(backend.get("nope").await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(backend.set_legal_hold("nope", true).await.unwrap_err().code(), "NOT_FOUND");
        assert!(!backend.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix_is_literal() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        for key in ["a_b/1", "axb/2", "a_b/0"] {
            backend.put(new_object(key, b"x")).await.unwrap();
        }
        assert_eq!(backend.list("a_b/", 10).await.unwrap(), vec!["a_b/0", "a_b/1"]);
        assert_eq!(backend.list("", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retention_bookkeeping() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        backend.put(new_object("g", b"x")).await.unwrap();

        let until = RetentionPolicy::governance(30).apply(Utc::now()).unwrap();
        backend.set_retention("g", until, false).await.unwrap();
        let meta = backend.head("g").await.unwrap();
        let recorded = meta.retention.unwrap();
        assert_eq!(recorded.mode, RetentionMode::Governance);
        assert_eq!(
            crate::hash::canonical_timestamp(&recorded.retain_until),
            crate::hash::canonical_timestamp(&until.retain_until)
        );
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.db");
        {
            let backend = RelationalBackend::open(&path).await.unwrap();
            backend.put(new_object("persist", b"kept")).await.unwrap();
        }
        let backend = RelationalBackend::open(&path).await.unwrap();
        assert_eq!(&backend.get("persist").await.unwrap().0[..], b"kept");
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_tamper_changes_bytes_only() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        backend.put(new_object("t", b"orig")).await.unwrap();
        assert!(backend.tamper("t", b"evil"));
        let (data, meta) = backend.get("t").await.unwrap();
        assert_eq!(&data[..], b"evil");
        assert_eq!(meta.content_hash.as_deref(), Some(sha256_hex(b"orig").as_str()));
    }
}
