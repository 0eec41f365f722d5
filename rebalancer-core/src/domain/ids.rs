use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic portfolio fingerprint (positions + securities + cash + pending orders).
///
/// The dedup/resume key for batch runs and the lookup key for the best plan so far.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortfolioHash(pub String);

impl PortfolioHash {
    /// BLAKE3 hex digest of a canonical byte string.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines and directory names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for PortfolioHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic identity of an ordered step list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceHash(pub String);

impl SequenceHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_hash() {
        assert_eq!(
            PortfolioHash::from_bytes(b"AAPL:10"),
            PortfolioHash::from_bytes(b"AAPL:10")
        );
        assert_ne!(
            SequenceHash::from_bytes(b"a"),
            SequenceHash::from_bytes(b"b")
        );
    }

    #[test]
    fn short_is_prefix() {
        let h = PortfolioHash::from_bytes(b"x");
        assert_eq!(h.short().len(), 12);
        assert!(h.as_str().starts_with(h.short()));
    }
}
