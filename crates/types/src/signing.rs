//! Signature preimage construction.
//!
//! Proposal and NPL signatures cover a blake3 hash of the message's
//! consensus fields, folded in a fixed order. Every implementation must
//! reproduce the order bit-exactly or signatures will not cross nodes;
//! the order here is the protocol's, independent of the wire codec.

use crate::{Hash, Proposal, PublicKey, SeqHash, Signature};
use std::collections::BTreeSet;

/// Incremental field hasher.
///
/// Integers fold as little-endian bytes, byte strings fold raw, sets fold
/// element-by-element in ascending order (the sets are ordered, so every
/// node iterates identically).
pub struct FieldHasher {
    inner: blake3::Hasher,
}

impl FieldHasher {
    /// Start a new preimage.
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Fold a single byte.
    pub fn add_u8(&mut self, v: u8) -> &mut Self {
        self.inner.update(&[v]);
        self
    }

    /// Fold a u32, little-endian.
    pub fn add_u32(&mut self, v: u32) -> &mut Self {
        self.inner.update(&v.to_le_bytes());
        self
    }

    /// Fold a u64, little-endian.
    pub fn add_u64(&mut self, v: u64) -> &mut Self {
        self.inner.update(&v.to_le_bytes());
        self
    }

    /// Fold raw bytes.
    pub fn add_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.inner.update(v);
        self
    }

    /// Fold a hash value.
    pub fn add_hash(&mut self, v: &Hash) -> &mut Self {
        self.inner.update(v.as_bytes());
        self
    }

    /// Fold an optional hash; absent folds nothing, matching a message
    /// that omits the field entirely.
    pub fn add_opt_hash(&mut self, v: &Option<Hash>) -> &mut Self {
        if let Some(h) = v {
            self.add_hash(h);
        }
        self
    }

    /// Fold an optional signature the same way.
    pub fn add_opt_sig(&mut self, v: &Option<Signature>) -> &mut Self {
        if let Some(s) = v {
            self.add_bytes(s.as_bytes());
        }
        self
    }

    /// Fold a sequence-hash pair.
    pub fn add_seq_hash(&mut self, v: &SeqHash) -> &mut Self {
        self.add_u64(v.seq_no).add_hash(&v.hash)
    }

    /// Fold an ordered set of public keys.
    pub fn add_pubkey_set(&mut self, set: &BTreeSet<PublicKey>) -> &mut Self {
        for pk in set {
            self.inner.update(pk.as_bytes());
        }
        self
    }

    /// Fold an ordered set of hashes.
    pub fn add_hash_set(&mut self, set: &BTreeSet<Hash>) -> &mut Self {
        for h in set {
            self.inner.update(h.as_bytes());
        }
        self
    }

    /// Finish and return the digest.
    pub fn finish(&self) -> Hash {
        Hash::from(*self.inner.finalize().as_bytes())
    }
}

impl Default for FieldHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash the consensus fields of a proposal.
///
/// Field order: stage, time, time_config, group_nonce, users,
/// input_ordered_hashes, output_hash, output_sig, state_hash, patch_hash,
/// last_primary_shard_id, last_raw_shard_id. The node nonce rides the
/// wire but is not part of the preimage; it only feeds the group-nonce
/// XOR of the next stage.
pub fn hash_proposal(p: &Proposal) -> Hash {
    let mut hasher = FieldHasher::new();
    hasher
        .add_u8(p.stage as u8)
        .add_u64(p.time)
        .add_u32(p.time_config)
        .add_hash(&p.group_nonce)
        .add_pubkey_set(&p.users)
        .add_hash_set(&p.input_ordered_hashes)
        .add_opt_hash(&p.output_hash)
        .add_opt_sig(&p.output_sig)
        .add_hash(&p.state_hash)
        .add_hash(&p.patch_hash)
        .add_seq_hash(&p.last_primary_shard_id)
        .add_seq_hash(&p.last_raw_shard_id);
    hasher.finish()
}

/// Hash an NPL message: the payload plus the round it belongs to.
pub fn hash_npl_message(data: &[u8], lcl_id: &SeqHash) -> Hash {
    let mut hasher = FieldHasher::new();
    hasher.add_bytes(data).add_seq_hash(lcl_id);
    hasher.finish()
}
