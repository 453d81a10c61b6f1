//! Ledger point identifier.

use crate::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a point in the ledger: a sequence number plus the hash
/// recorded at it.
///
/// Used for the last-closed-ledger id, shard tail ids carried in
/// proposals, and the joining point exchanged during log sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SeqHash {
    /// Ledger sequence number.
    pub seq_no: u64,
    /// Hash recorded at that sequence number.
    pub hash: Hash,
}

impl SeqHash {
    /// Construct from parts.
    pub fn new(seq_no: u64, hash: Hash) -> Self {
        Self { seq_no, hash }
    }

    /// The genesis point (seq 0, zero hash) unless overridden.
    pub fn genesis() -> Self {
        Self::default()
    }
}

impl fmt::Display for SeqHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:?}", self.seq_no, self.hash)
    }
}
