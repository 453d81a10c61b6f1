//! Ledger records.

use crate::{FieldHasher, Hash, PublicKey};
use serde::{Deserialize, Serialize};

/// One committed consensus round.
///
/// `ledger_hash` chains each record to its predecessor; side rows (users,
/// inputs, outputs) live next to it in the shard store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Position in the chain, starting at 1 (0 is genesis).
    pub seq_no: u64,
    /// Consensus time of the round, ms.
    pub timestamp: u64,
    /// Hash of this record (see [`LedgerRecord::compute_hash`]).
    pub ledger_hash: Hash,
    /// Hash of the previous record.
    pub prev_ledger_hash: Hash,
    /// Digest of the round's admitted data (users + inputs + outputs).
    pub data_hash: Hash,
    /// vfs state root after execution.
    pub state_hash: Hash,
    /// vfs patch (config) root after execution.
    pub config_hash: Hash,
    /// The round's agreed group nonce.
    pub nonce: Hash,
    /// Digest of the admitted user set.
    pub user_hash: Hash,
    /// Digest of the admitted input set.
    pub input_hash: Hash,
    /// Digest of the execution output set.
    pub output_hash: Hash,
}

impl LedgerRecord {
    /// The genesis record: seq 0, all hashes zero.
    pub fn genesis() -> Self {
        Self {
            seq_no: 0,
            timestamp: 0,
            ledger_hash: Hash::ZERO,
            prev_ledger_hash: Hash::ZERO,
            data_hash: Hash::ZERO,
            state_hash: Hash::ZERO,
            config_hash: Hash::ZERO,
            nonce: Hash::ZERO,
            user_hash: Hash::ZERO,
            input_hash: Hash::ZERO,
            output_hash: Hash::ZERO,
        }
    }

    /// Compute the chained record hash from the other fields.
    ///
    /// Order: prev_ledger_hash, data_hash, state_hash, config_hash,
    /// user_hash, input_hash, output_hash, seq_no, timestamp, nonce.
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = FieldHasher::new();
        hasher
            .add_hash(&self.prev_ledger_hash)
            .add_hash(&self.data_hash)
            .add_hash(&self.state_hash)
            .add_hash(&self.config_hash)
            .add_hash(&self.user_hash)
            .add_hash(&self.input_hash)
            .add_hash(&self.output_hash)
            .add_u64(self.seq_no)
            .add_u64(self.timestamp)
            .add_hash(&self.nonce);
        hasher.finish()
    }

    /// Seal the record: stamp `ledger_hash` from the current fields.
    pub fn seal(mut self) -> Self {
        self.ledger_hash = self.compute_hash();
        self
    }
}

/// An admitted input as persisted beside its ledger record.
///
/// The blob itself lives in the raw shard's blob file at
/// `(blob_offset, blob_size)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInputRow {
    /// Round the input was admitted in.
    pub ledger_seq_no: u64,
    /// Submitting user.
    pub pubkey: PublicKey,
    /// Digest of the input container.
    pub hash: Hash,
    /// User replay nonce.
    pub nonce: u64,
    /// Offset into the raw shard blob file.
    pub blob_offset: u64,
    /// Byte length inside the blob file.
    pub blob_size: u64,
}

/// An execution output as persisted beside its ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOutputRow {
    /// Round the output was produced in.
    pub ledger_seq_no: u64,
    /// Addressed user.
    pub pubkey: PublicKey,
    /// Digest of this user's output set.
    pub hash: Hash,
    /// Offset into the raw shard blob file.
    pub blob_offset: u64,
    /// Number of output buffers at that offset.
    pub blob_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_hash;

    fn record(seq: u64, prev: Hash) -> LedgerRecord {
        LedgerRecord {
            seq_no: seq,
            timestamp: 1_700_000_000_000 + seq,
            ledger_hash: Hash::ZERO,
            prev_ledger_hash: prev,
            data_hash: test_hash(1),
            state_hash: test_hash(2),
            config_hash: test_hash(3),
            nonce: test_hash(4),
            user_hash: test_hash(5),
            input_hash: test_hash(6),
            output_hash: test_hash(7),
        }
        .seal()
    }

    #[test]
    fn seal_is_deterministic() {
        let a = record(1, Hash::ZERO);
        let b = record(1, Hash::ZERO);
        assert_eq!(a.ledger_hash, b.ledger_hash);
        assert_eq!(a.ledger_hash, a.compute_hash());
    }

    #[test]
    fn hash_chains_records() {
        let first = record(1, Hash::ZERO);
        let second = record(2, first.ledger_hash);
        let forged = record(2, test_hash(9));
        assert_ne!(second.ledger_hash, forged.ledger_hash);
    }

    #[test]
    fn genesis_is_all_zero() {
        let g = LedgerRecord::genesis();
        assert_eq!(g.seq_no, 0);
        assert!(g.ledger_hash.is_zero());
        assert!(g.state_hash.is_zero());
    }
}
