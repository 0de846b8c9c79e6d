//! Pickup-code generation stream.
//!
//! Codes are drawn from a single Pcg64Mcg stream: seeded from entropy in
//! production, from a fixed seed in tests so runs are reproducible.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

pub struct CodeRng {
    inner: Pcg64Mcg,
}

impl CodeRng {
    /// Entropy-seeded stream for production use.
    pub fn from_entropy() -> Self {
        Self {
            inner: Pcg64Mcg::from_entropy(),
        }
    }

    /// Deterministic stream for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// A 4-digit numeric pickup code, zero-padded.
    pub fn pickup_code(&mut self) -> String {
        format!("{:04}", self.next_u64_below(10_000))
    }
}
