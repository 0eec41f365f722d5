//! Deterministic RNG hierarchy for Monte-Carlo evaluation.
//!
//! A master seed generates sub-seeds for each `(portfolio, sequence, path)`
//! tuple. Sub-seeds are derived via BLAKE3 hashing, independently of evaluation
//! order, so a plan scores the same whether it is evaluated first or last, on
//! one thread or many.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::domain::{PortfolioHash, SequenceHash};

#[derive(Debug, Clone)]
pub struct RngHierarchy {
    master_seed: u64,
}

impl RngHierarchy {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Derive a deterministic sub-seed for one price path of one plan.
    pub fn sub_seed(&self, portfolio: &PortfolioHash, sequence: &SequenceHash, path: u64) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.master_seed.to_le_bytes());
        hasher.update(portfolio.as_str().as_bytes());
        hasher.update(sequence.as_str().as_bytes());
        hasher.update(&path.to_le_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    pub fn rng_for(&self, portfolio: &PortfolioHash, sequence: &SequenceHash, path: u64) -> StdRng {
        StdRng::seed_from_u64(self.sub_seed(portfolio, sequence, path))
    }
}
