//! Common test utilities for integration tests.

pub mod assertions;
pub mod fixtures;

use evidence_vault::checkpoint::{CheckpointEngine, CheckpointSigner};
use evidence_vault::ledger::{AuditLedger, MemoryLedgerStore, StorageLedgerStore};
use evidence_vault::observability::MemoryAlertSink;
use evidence_vault::storage::{
    ArchiveBackend, EvidenceStorage, FsArchiveClient, ImmutableBlobBackend, InMemoryBlobContainer,
    InMemoryObjectLockClient, ObjectLockBackend, RelationalBackend,
};
use evidence_vault::{EvidenceVault, RetentionMode};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

// Re-export common types
pub use assertions::*;
pub use fixtures::*;

pub const BUCKET: &str = "evidence";
pub const CONTAINER: &str = "evidence";

/// Test environment that owns a temporary directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Creates a sub-directory in the temp dir
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create subdir");
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// The medium behind a backend, kept so tests can reach around the façade.
#[derive(Clone)]
pub enum Medium {
    ObjectLock(Arc<InMemoryObjectLockClient>),
    Blob(Arc<InMemoryBlobContainer>),
    Relational(Arc<RelationalBackend>),
    Archive(Arc<FsArchiveClient>),
}

impl Medium {
    /// Overwrites stored bytes out-of-band, leaving recorded metadata alone.
    pub fn tamper(&self, key: &str, body: &[u8]) -> bool {
        match self {
            Medium::ObjectLock(client) => client.tamper(BUCKET, key, body.to_vec()),
            Medium::Blob(client) => client.tamper(CONTAINER, key, body.to_vec()),
            Medium::Relational(backend) => backend.tamper(key, body),
            Medium::Archive(client) => match client.object_path(key) {
                Ok(path) if path.exists() => std::fs::write(path, body).is_ok(),
                _ => false,
            },
        }
    }
}

/// A façade over one backend plus a handle on its medium.
pub struct TestBackend {
    pub name: &'static str,
    pub storage: EvidenceStorage,
    pub medium: Medium,
}

pub fn object_lock_backend() -> TestBackend {
    let client = Arc::new(InMemoryObjectLockClient::with_bucket(BUCKET));
    let backend = ObjectLockBackend::new(client.clone(), BUCKET, RetentionMode::Compliance);
    TestBackend {
        name: "object-lock",
        storage: EvidenceStorage::new(Arc::new(backend)),
        medium: Medium::ObjectLock(client),
    }
}

pub fn blob_backend() -> TestBackend {
    let client = Arc::new(InMemoryBlobContainer::with_container(CONTAINER));
    let backend = ImmutableBlobBackend::new(client.clone(), CONTAINER);
    TestBackend {
        name: "immutable-blob",
        storage: EvidenceStorage::new(Arc::new(backend)),
        medium: Medium::Blob(client),
    }
}

pub async fn relational_backend(env: &TestEnv) -> TestBackend {
    let backend = Arc::new(
        RelationalBackend::open(&env.path("evidence.db"))
            .await
            .expect("Failed to open sqlite backend"),
    );
    TestBackend {
        name: "relational",
        storage: EvidenceStorage::new(backend.clone()),
        medium: Medium::Relational(backend),
    }
}

pub async fn archive_backend(env: &TestEnv) -> TestBackend {
    let client = Arc::new(
        FsArchiveClient::open(&env.subdir("archive"))
            .await
            .expect("Failed to open archive"),
    );
    TestBackend {
        name: "archive",
        storage: EvidenceStorage::new(Arc::new(ArchiveBackend::new(client.clone()))),
        medium: Medium::Archive(client),
    }
}

/// One of every backend variant.
pub async fn all_backends(env: &TestEnv) -> Vec<TestBackend> {
    vec![
        object_lock_backend(),
        blob_backend(),
        relational_backend(env).await,
        archive_backend(env).await,
    ]
}

/// A vault assembled from parts, with handles for tampering and alerts.
pub struct TestVault {
    pub vault: EvidenceVault,
    pub medium: Medium,
    pub alerts: Arc<MemoryAlertSink>,
}

/// Vault over `backend` whose ledger lives in the same storage.
pub async fn vault_on(backend: TestBackend) -> TestVault {
    let ledger = Arc::new(
        AuditLedger::open(Arc::new(StorageLedgerStore::new(backend.storage.clone())))
            .await
            .expect("Failed to open ledger"),
    );
    assemble(backend, ledger)
}

/// Vault over `backend` with an in-memory ledger the test can tamper with.
pub async fn vault_with_memory_ledger(backend: TestBackend) -> (TestVault, Arc<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = Arc::new(AuditLedger::open(store.clone()).await.expect("Failed to open ledger"));
    (assemble(backend, ledger), store)
}

fn assemble(backend: TestBackend, ledger: Arc<AuditLedger>) -> TestVault {
    let signer = CheckpointSigner::generate().expect("Failed to generate signing key");
    let engine = CheckpointEngine::new(backend.storage.clone(), ledger.clone(), signer);
    let alerts = Arc::new(MemoryAlertSink::new(64));
    let vault = EvidenceVault::from_parts(backend.storage, ledger, engine)
        .with_alert_sink(alerts.clone());
    TestVault {
        vault,
        medium: backend.medium,
        alerts,
    }
}
