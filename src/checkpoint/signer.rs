//! ECDSA P-256 checkpoint signing.

use crate::error::{Result, VaultError};
use crate::hash::canonical_timestamp;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use std::path::Path;
use tracing::info;

/// Bytes signed for a checkpoint:
/// `merkle_root|timestamp|previous_checkpoint`, with an empty last field
/// for the first checkpoint.
pub fn signing_message(
    merkle_root: &str,
    timestamp: &DateTime<Utc>,
    previous_checkpoint: Option<&str>,
) -> Vec<u8> {
    format!(
        "{}|{}|{}",
        merkle_root,
        canonical_timestamp(timestamp),
        previous_checkpoint.unwrap_or("")
    )
    .into_bytes()
}

/// Holder of the checkpoint signing key.
pub struct CheckpointSigner {
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
}

impl CheckpointSigner {
    /// Fresh PKCS#8 document for a new P-256 key.
    pub fn generate_pkcs8() -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| VaultError::Signing("key generation failed".to_string()))?;
        Ok(doc.as_ref().to_vec())
    }

    /// Signer with a freshly generated key that is never persisted.
    pub fn generate() -> Result<Self> {
        Self::from_pkcs8(&Self::generate_pkcs8()?)
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
            .map_err(|e| VaultError::Signing(format!("invalid PKCS#8 key: {}", e)))?;
        Ok(Self { key_pair, rng })
    }

    /// Loads a DER-encoded PKCS#8 key file.
    pub fn load(path: &Path) -> Result<Self> {
        let pkcs8 = std::fs::read(path)?;
        let signer = Self::from_pkcs8(&pkcs8)?;
        info!(path = %path.display(), public_key = %signer.public_key_hex(), "Loaded checkpoint signing key");
        Ok(signer)
    }

    /// Uncompressed SEC1 public key, hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key_pair.public_key().as_ref())
    }

    /// Fixed-width (r || s) signature, base64.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let signature = self
            .key_pair
            .sign(&self.rng, message)
            .map_err(|_| VaultError::Signing("signing failed".to_string()))?;
        Ok(STANDARD.encode(signature.as_ref()))
    }
}

/// True if `signature` (base64) is valid for `message` under
/// `public_key_hex`. Malformed inputs verify as false.
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature: &str) -> bool {
    let Ok(public_key) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(signature) = STANDARD.decode(signature) else {
        return false;
    };
    UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, public_key)
        .verify(message, &signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = CheckpointSigner::generate().unwrap();
        let msg = signing_message(&"ab".repeat(32), &Utc::now(), None);
        let sig = signer.sign(&msg).unwrap();

        assert!(verify_signature(&signer.public_key_hex(), &msg, &sig));
        assert!(!verify_signature(&signer.public_key_hex(), b"other", &sig));

        let other = CheckpointSigner::generate().unwrap();
        assert!(!verify_signature(&other.public_key_hex(), &msg, &sig));
        assert!(!verify_signature("not hex", &msg, &sig));
        assert!(!verify_signature(&signer.public_key_hex(), &msg, "@@@"));
    }

    #[test]
    fn test_public_key_is_uncompressed_p256() {
        let signer = CheckpointSigner::generate().unwrap();
        let pk = signer.public_key_hex();
        assert_eq!(pk.len(), 130);
        assert!(pk.starts_with("04"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.pk8");
        let pkcs8 = CheckpointSigner::generate_pkcs8().unwrap();
        std::fs::write(&path, &pkcs8).unwrap();

        let a = CheckpointSigner::load(&path).unwrap();
        let b = CheckpointSigner::from_pkcs8(&pkcs8).unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());

        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(CheckpointSigner::load(&path), Err(VaultError::Signing(_))));
    }

    #[test]
    fn test_message_binds_previous() {
        let ts = Utc::now();
        let root = "cd".repeat(32);
        assert_ne!(
            signing_message(&root, &ts, None),
            signing_message(&root, &ts, Some("cp-1"))
        );
        let text = String::from_utf8(signing_message(&root, &ts, Some("cp-1"))).unwrap();
        assert!(text.ends_with("|cp-1"));
    }
}
