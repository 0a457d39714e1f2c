use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-hash identifier of a strategy descriptor (16 lowercase hex chars).
///
/// Derived from the descriptor's creation inputs, so the same inputs always
/// produce the same id. Ordering is lexicographic and serves as the
/// deterministic tiebreak when fitness values are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DescriptorId(pub String);

impl DescriptorId {
    pub const LEN: usize = 16;

    /// Truncate a BLAKE3 digest to the id width.
    pub fn from_hash(hash: &blake3::Hash) -> Self {
        let hex = hash.to_hex();
        Self(hex.as_str()[..Self::LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id has the expected width and alphabet.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == Self::LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
