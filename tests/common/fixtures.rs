// Test fixtures and data generators for integration tests

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic random data generator for reproducible tests
pub struct TestDataGenerator {
    rng: StdRng,
}

impl TestDataGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generates random bytes of specified length
    pub fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.rng.fill(&mut bytes[..]);
        bytes
    }

    /// Generates a random string of specified length
    pub fn random_string(&mut self, len: usize) -> String {
        (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    /// An evidence key shaped like `<framework>/<control>/<name>.pdf`.
    pub fn evidence_key(&mut self, framework: &str) -> String {
        format!(
            "{}/{}/{}.pdf",
            framework,
            self.random_string(4).to_lowercase(),
            self.random_string(10).to_lowercase()
        )
    }

    /// A fake document body of roughly `len` bytes.
    pub fn document(&mut self, len: usize) -> Vec<u8> {
        let mut body = b"%PDF-1.7\n".to_vec();
        body.extend(self.random_bytes(len.saturating_sub(body.len())));
        body
    }
}
