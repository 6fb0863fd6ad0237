//! SHA-256 helpers shared by storage, ledger and checkpoints.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// True if `s` looks like a hex-encoded SHA-256 digest.
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Canonical timestamp form used in every hashed or signed encoding.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Leaf hash committed to the Merkle tree for one piece of evidence.
///
/// Binds the storage key, the content hash and the store time so two
/// submissions of identical bytes under different keys yield distinct leaves.
pub fn evidence_leaf_hash(key: &str, content_hash: &str, stored_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"evidence-leaf:v1\n");
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
    hasher.update(content_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_timestamp(stored_at).as_bytes());
    hex::encode(hasher.finalize())
}
