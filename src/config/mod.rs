//! Configuration for the evidence vault.
//!
//! Loaded from a JSON file, from `EVIDENCE_*` environment variables, or built
//! in code. The environment surface:
//!
//! | variable | field |
//! |----------|-------|
//! | `EVIDENCE_STORAGE_BACKEND` | `storage.backend` (`object-lock`, `immutable-blob`, `relational`, `archive`) |
//! | `EVIDENCE_BUCKET` | `storage.bucket` |
//! | `EVIDENCE_CONTAINER` | `storage.container` |
//! | `EVIDENCE_DATABASE_PATH` | `storage.database_path` |
//! | `EVIDENCE_ARCHIVE_ROOT` | `storage.archive_root` |
//! | `EVIDENCE_KEY_PREFIX` | `storage.key_prefix` |
//! | `EVIDENCE_OPERATION_TIMEOUT` | `storage.operation_timeout` |
//! | `EVIDENCE_RETENTION_DAYS` | `retention.default_days` |
//! | `EVIDENCE_LOCK_MODE` | `retention.lock_mode` |
//! | `EVIDENCE_CHECKPOINT_INTERVAL` | `checkpoint.interval` |
//! | `EVIDENCE_CHECKPOINT_RETENTION_DAYS` | `checkpoint.retention_days` |
//! | `EVIDENCE_SIGNING_KEY_PATH` | `checkpoint.signing_key_path` |
//! | `EVIDENCE_LOG_LEVEL` | `logging.level` |
//! | `EVIDENCE_LOG_JSON` | `logging.json` |

use crate::error::{Result, VaultError};
use crate::retention::{RetentionMode, RetentionPolicy, DEFAULT_RETENTION_DAYS, MAX_RETENTION_DAYS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for an evidence vault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

impl VaultConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VaultError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| VaultError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source. Unset variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(v) = get("EVIDENCE_STORAGE_BACKEND") {
            config.storage.backend = parse_var("EVIDENCE_STORAGE_BACKEND", &v)?;
        }
        config.storage.bucket = get("EVIDENCE_BUCKET").or(config.storage.bucket);
        config.storage.container = get("EVIDENCE_CONTAINER").or(config.storage.container);
        if let Some(v) = get("EVIDENCE_DATABASE_PATH") {
            config.storage.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("EVIDENCE_ARCHIVE_ROOT") {
            config.storage.archive_root = Some(PathBuf::from(v));
        }
        if let Some(v) = get("EVIDENCE_KEY_PREFIX") {
            config.storage.key_prefix = v;
        }
        if let Some(v) = get("EVIDENCE_OPERATION_TIMEOUT") {
            config.storage.operation_timeout = parse_duration_var("EVIDENCE_OPERATION_TIMEOUT", &v)?;
        }
        if let Some(v) = get("EVIDENCE_RETENTION_DAYS") {
            config.retention.default_days = parse_var("EVIDENCE_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("EVIDENCE_LOCK_MODE") {
            config.retention.lock_mode = parse_var("EVIDENCE_LOCK_MODE", &v)?;
        }
        if let Some(v) = get("EVIDENCE_CHECKPOINT_INTERVAL") {
            config.checkpoint.interval = parse_duration_var("EVIDENCE_CHECKPOINT_INTERVAL", &v)?;
        }
        if let Some(v) = get("EVIDENCE_CHECKPOINT_RETENTION_DAYS") {
            config.checkpoint.retention_days = parse_var("EVIDENCE_CHECKPOINT_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("EVIDENCE_SIGNING_KEY_PATH") {
            config.checkpoint.signing_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("EVIDENCE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = get("EVIDENCE_LOG_JSON") {
            config.logging.json = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;
        let missing = |field: &str, value: bool| -> Result<()> {
            if value {
                Ok(())
            } else {
                Err(VaultError::InvalidConfig {
                    field: field.to_string(),
                    reason: format!("required for the {} backend", storage.backend),
                })
            }
        };

        match storage.backend {
            BackendKind::ObjectLock => missing(
                "storage.bucket",
                storage.bucket.as_deref().is_some_and(|b| !b.is_empty()),
            )?,
            BackendKind::ImmutableBlob => missing(
                "storage.container",
                storage.container.as_deref().is_some_and(|c| !c.is_empty()),
            )?,
            BackendKind::Relational => {
                missing("storage.database_path", storage.database_path.is_some())?
            }
            BackendKind::Archive => missing("storage.archive_root", storage.archive_root.is_some())?,
        }

        if storage.operation_timeout.is_zero() {
            return Err(VaultError::InvalidConfig {
                field: "storage.operation_timeout".to_string(),
                reason: "Timeout must be non-zero".to_string(),
            });
        }

        if self.retention.lock_mode == RetentionMode::Compliance && self.retention.default_days == 0 {
            return Err(VaultError::InvalidConfig {
                field: "retention.default_days".to_string(),
                reason: "Compliance retention must be at least one day".to_string(),
            });
        }

        for (field, days) in [
            ("retention.default_days", self.retention.default_days),
            ("checkpoint.retention_days", self.checkpoint.retention_days),
        ] {
            if days > MAX_RETENTION_DAYS {
                return Err(VaultError::InvalidConfig {
                    field: field.to_string(),
                    reason: format!("Retention must not exceed {} days", MAX_RETENTION_DAYS),
                });
            }
        }

        if self.checkpoint.interval.is_zero() {
            return Err(VaultError::InvalidConfig {
                field: "checkpoint.interval".to_string(),
                reason: "Checkpoint interval must be non-zero".to_string(),
            });
        }

        if self.checkpoint.retention_days == 0 {
            return Err(VaultError::InvalidConfig {
                field: "checkpoint.retention_days".to_string(),
                reason: "Checkpoint retention must be at least one day".to_string(),
            });
        }

        Ok(())
    }

    /// Development configuration: SQLite in the working directory, short
    /// checkpoint interval, governance mode, debug logging.
    pub fn development() -> Self {
        Self {
            storage: StorageConfig {
                backend: BackendKind::Relational,
                database_path: Some(PathBuf::from("evidence-dev.db")),
                key_prefix: "dev/".to_string(),
                ..Default::default()
            },
            retention: RetentionConfig {
                default_days: 1,
                lock_mode: RetentionMode::Governance,
            },
            checkpoint: CheckpointConfig {
                interval: Duration::from_secs(60),
                retention_days: 1,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| VaultError::InvalidConfig {
        field: name.to_string(),
        reason: e.to_string(),
    })
}

fn parse_duration_var(name: &str, value: &str) -> Result<Duration> {
    humantime_serde::parse_duration(value).map_err(|reason| VaultError::InvalidConfig {
        field: name.to_string(),
        reason,
    })
}

/// Physical medium behind the storage façade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Locked-retention object store.
    #[default]
    ObjectLock,
    /// Immutable-policy blob store.
    ImmutableBlob,
    /// SQLite, development only.
    Relational,
    /// Low-cost store without lock support.
    Archive,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::ObjectLock => "object-lock",
            BackendKind::ImmutableBlob => "immutable-blob",
            BackendKind::Relational => "relational",
            BackendKind::Archive => "archive",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "object-lock" | "s3" => Ok(BackendKind::ObjectLock),
            "immutable-blob" | "azure" => Ok(BackendKind::ImmutableBlob),
            "relational" | "sqlite" => Ok(BackendKind::Relational),
            "archive" => Ok(BackendKind::Archive),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Lock-enabled bucket for the object-lock backend.
    pub bucket: Option<String>,
    /// Container for the immutable-blob backend.
    pub container: Option<String>,
    /// SQLite file for the relational backend.
    pub database_path: Option<PathBuf>,
    /// Root directory for the archive backend.
    pub archive_root: Option<PathBuf>,
    /// Prepended to every key.
    pub key_prefix: String,
    /// Per-call timeout against the backend.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            bucket: None,
            container: None,
            database_path: None,
            archive_root: None,
            key_prefix: String::new(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Default retention applied to submitted evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub default_days: u32,
    pub lock_mode: RetentionMode,
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention_days: self.default_days,
            mode: self.lock_mode,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_days: DEFAULT_RETENTION_DAYS,
            lock_mode: RetentionMode::Compliance,
        }
    }
}

/// Checkpoint engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Compliance retention applied to checkpoint objects.
    pub retention_days: u32,
    /// PKCS#8 P-256 key. An ephemeral key is generated when unset.
    pub signing_key_path: Option<PathBuf>,
    /// Actor recorded on `CHECKPOINT_CREATED` entries.
    pub actor: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention_days: DEFAULT_RETENTION_DAYS,
            signing_key_path: None,
            actor: "system:checkpoint".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parses `500ms`, `30s`, `5m`, `2h`, `1d`; a bare number is milliseconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (value, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
            return ms
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{}': {}", s, e));
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3600)
        } else if let Some(v) = s.strip_suffix('d') {
            (v, 86_400)
        } else {
            return s
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{}': {}", s, e));
        };
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * unit_secs))
            .map_err(|e| format!("invalid duration '{}': {}", s, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert_eq!(config.storage.backend, BackendKind::ObjectLock);
        assert_eq!(config.retention.default_days, 2557);
        assert_eq!(config.retention.lock_mode, RetentionMode::Compliance);
        // Object-lock needs a bucket.
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_development_config() {
        let config = VaultConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, BackendKind::Relational);
    }

    #[test]
    fn test_from_lookup() {
        let config = VaultConfig::from_lookup(lookup(&[
            ("EVIDENCE_STORAGE_BACKEND", "object-lock"),
            ("EVIDENCE_BUCKET", "audit-evidence"),
            ("EVIDENCE_RETENTION_DAYS", "365"),
            ("EVIDENCE_LOCK_MODE", "governance"),
            ("EVIDENCE_KEY_PREFIX", "soc2/"),
            ("EVIDENCE_CHECKPOINT_INTERVAL", "15m"),
            ("EVIDENCE_LOG_JSON", "true"),
        ]))
        .unwrap();

        assert_eq!(config.storage.bucket.as_deref(), Some("audit-evidence"));
        assert_eq!(config.retention.default_days, 365);
        assert_eq!(config.retention.lock_mode, RetentionMode::Governance);
        assert_eq!(config.storage.key_prefix, "soc2/");
        assert_eq!(config.checkpoint.interval, Duration::from_secs(900));
        assert!(config.logging.json);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = VaultConfig::from_lookup(lookup(&[("EVIDENCE_STORAGE_BACKEND", "tape")]))
            .unwrap_err();
        assert!(err.to_string().contains("EVIDENCE_STORAGE_BACKEND"));

        let err = VaultConfig::from_lookup(lookup(&[
            ("EVIDENCE_STORAGE_BACKEND", "archive"),
            ("EVIDENCE_ARCHIVE_ROOT", "/tmp/a"),
            ("EVIDENCE_RETENTION_DAYS", "-1"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("EVIDENCE_RETENTION_DAYS"));
    }

    #[test]
    fn test_backend_requirements() {
        let config = VaultConfig::from_lookup(lookup(&[("EVIDENCE_STORAGE_BACKEND", "immutable-blob")]));
        assert!(matches!(
            config,
            Err(VaultError::InvalidConfig { ref field, .. }) if field == "storage.container"
        ));
    }

    #[test]
    fn test_compliance_needs_days() {
        let mut config = VaultConfig::development();
        config.retention.lock_mode = RetentionMode::Compliance;
        config.retention.default_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_days_bounded() {
        let err = VaultConfig::from_lookup(lookup(&[
            ("EVIDENCE_STORAGE_BACKEND", "archive"),
            ("EVIDENCE_ARCHIVE_ROOT", "/tmp/a"),
            ("EVIDENCE_RETENTION_DAYS", "4294967295"),
        ]))
        .unwrap_err();
        assert!(matches!(err, VaultError::InvalidConfig { ref field, .. } if field == "retention.default_days"));

        let mut config = VaultConfig::development();
        config.checkpoint.retention_days = MAX_RETENTION_DAYS + 1;
        assert!(config.validate().is_err());
        config.checkpoint.retention_days = MAX_RETENTION_DAYS;
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_duration() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        std::fs::write(
            &path,
            r#"{
                "storage": { "backend": "archive", "archive_root": "/srv/archive",
                             "operation_timeout": "10s" },
                "retention": { "default_days": 30, "lock_mode": "GOVERNANCE" },
                "checkpoint": { "interval": "5m" }
            }"#,
        )
        .unwrap();

        let config = VaultConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.backend, BackendKind::Archive);
        assert_eq!(config.storage.operation_timeout, Duration::from_secs(10));
        assert_eq!(config.retention.policy(), RetentionPolicy::governance(30));
        assert_eq!(config.checkpoint.interval, Duration::from_secs(300));
        assert_eq!(config.logging.level, "info");
    }
}
