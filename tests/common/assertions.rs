// Custom test assertions for integration tests

use evidence_vault::{ErrorKind, VaultError};
use std::time::{Duration, Instant};

/// Asserts that a result failed with the given taxonomy kind.
#[track_caller]
pub fn assert_storage_kind<T: std::fmt::Debug>(
    result: Result<T, VaultError>,
    expected: ErrorKind,
) {
    match result {
        Ok(value) => panic!("expected {:?}, got Ok({:?})", expected, value),
        Err(e) => assert_eq!(
            e.storage_kind(),
            Some(expected),
            "expected {:?}, got error: {}",
            expected,
            e
        ),
    }
}

/// Asserts that a result failed as tamper evidence, at `position` when given.
#[track_caller]
pub fn assert_chain_broken<T: std::fmt::Debug>(result: Result<T, VaultError>, position: u64) {
    match result {
        Err(VaultError::ChainBroken { position: actual, .. }) => {
            assert_eq!(actual, position, "chain broken at the wrong position")
        }
        other => panic!("expected ChainBroken at {}, got {:?}", position, other),
    }
}

/// Retry a condition until it holds or times out
pub async fn assert_eventually<F, Fut>(mut f: F, timeout: Duration, message: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within {:?}: {}", timeout, message);
}
