//! Consensus proposals.

use crate::{hash_proposal, Hash, KeyPair, PublicKey, SeqHash, Signature, SignatureError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One of the four sub-phases of a round.
///
/// Stage 0 collects candidate inputs, stage 1 locks the merged input
/// set, stage 2 publishes the execution result, stage 3 commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Stage {
    /// Collect candidate inputs.
    Stage0 = 0,
    /// Lock the merged input set.
    Stage1 = 1,
    /// Publish the execution result.
    Stage2 = 2,
    /// Commit.
    Stage3 = 3,
}

impl Stage {
    /// The stage that feeds this one, if any.
    pub fn prev(&self) -> Option<Stage> {
        match self {
            Stage::Stage0 => None,
            Stage::Stage1 => Some(Stage::Stage0),
            Stage::Stage2 => Some(Stage::Stage1),
            Stage::Stage3 => Some(Stage::Stage2),
        }
    }

    /// The next stage, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Stage0 => Some(Stage::Stage1),
            Stage::Stage1 => Some(Stage::Stage2),
            Stage::Stage2 => Some(Stage::Stage3),
            Stage::Stage3 => None,
        }
    }

    /// Decode from the wire byte.
    pub fn from_u8(v: u8) -> Option<Stage> {
        match v {
            0 => Some(Stage::Stage0),
            1 => Some(Stage::Stage1),
            2 => Some(Stage::Stage2),
            3 => Some(Stage::Stage3),
            _ => None,
        }
    }
}

/// A stage proposal: one UNL member's view of the round.
///
/// Immutable once signed. The signature covers the preimage produced by
/// [`hash_proposal`]; `pubkey`, `sig`, the transport timestamps and the
/// node nonce are outside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Signer. Must be a UNL member for the proposal to count.
    pub pubkey: PublicKey,
    /// Signature over [`hash_proposal`].
    pub sig: Signature,
    /// Which sub-phase this proposal belongs to.
    pub stage: Stage,
    /// Proposer's wall clock, ms.
    pub time: u64,
    /// Time granularity (ms) the proposer believes the UNL majority uses.
    pub time_config: u32,
    /// This node's fresh per-round nonce.
    pub node_nonce: Hash,
    /// XOR of the contributing signers' node nonces.
    pub group_nonce: Hash,
    /// Users with pending input this round.
    pub users: BTreeSet<PublicKey>,
    /// Digests of the inputs the proposer would admit, canonically ordered.
    pub input_ordered_hashes: BTreeSet<Hash>,
    /// Deterministic hash of the execution outputs (stages >= 2).
    pub output_hash: Option<Hash>,
    /// Signature over `output_hash` (stages >= 2).
    pub output_sig: Option<Signature>,
    /// Expected post-execution state root.
    pub state_hash: Hash,
    /// Expected post-execution patch (config) root.
    pub patch_hash: Hash,
    /// Tail of the primary ledger shard chain as the proposer sees it.
    pub last_primary_shard_id: SeqHash,
    /// Tail of the raw shard chain as the proposer sees it.
    pub last_raw_shard_id: SeqHash,
    /// Transport-observed send time (wire metadata, unsigned).
    #[serde(default)]
    pub sent_timestamp: u64,
    /// Local receive time (never serialized).
    #[serde(skip)]
    pub recv_timestamp: u64,
    /// Whether this proposal originated locally (derived on receipt).
    #[serde(skip)]
    pub from_self: bool,
}

impl Proposal {
    /// Start an unsigned proposal with empty merged fields.
    pub fn build(stage: Stage, time: u64, time_config: u32) -> Self {
        Self {
            pubkey: PublicKey([0u8; crate::PUBKEY_LEN]),
            sig: Signature([0u8; crate::SIG_LEN]),
            stage,
            time,
            time_config,
            node_nonce: Hash::ZERO,
            group_nonce: Hash::ZERO,
            users: BTreeSet::new(),
            input_ordered_hashes: BTreeSet::new(),
            output_hash: None,
            output_sig: None,
            state_hash: Hash::ZERO,
            patch_hash: Hash::ZERO,
            last_primary_shard_id: SeqHash::genesis(),
            last_raw_shard_id: SeqHash::genesis(),
            sent_timestamp: 0,
            recv_timestamp: 0,
            from_self: false,
        }
    }

    /// Sign in place with the node key, setting `pubkey` and `from_self`.
    pub fn sign(&mut self, key: &KeyPair) {
        self.pubkey = key.public_key();
        self.from_self = true;
        let hash = hash_proposal(self);
        self.sig = key.sign(hash.as_bytes());
    }

    /// Verify the signature against the consensus-field preimage.
    ///
    /// Returns the preimage hash so callers can reuse it as the
    /// proposal's identity.
    pub fn verify(&self) -> Result<Hash, SignatureError> {
        let hash = hash_proposal(self);
        self.pubkey.verify(hash.as_bytes(), &self.sig)?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_hash, test_keypair};

    #[test]
    fn stage_sequence() {
        assert_eq!(Stage::Stage0.prev(), None);
        assert_eq!(Stage::Stage0.next(), Some(Stage::Stage1));
        assert_eq!(Stage::Stage3.next(), None);
        assert_eq!(Stage::from_u8(3), Some(Stage::Stage3));
        assert_eq!(Stage::from_u8(4), None);
    }

    #[test]
    fn sign_then_verify() {
        let kp = test_keypair(1);
        let mut p = Proposal::build(Stage::Stage0, 1000, 1000);
        p.node_nonce = test_hash(1);
        p.sign(&kp);
        assert!(p.verify().is_ok());
        assert_eq!(p.pubkey, kp.public_key());
    }

    #[test]
    fn tampered_proposal_fails_verification() {
        let kp = test_keypair(1);
        let mut p = Proposal::build(Stage::Stage0, 1000, 1000);
        p.sign(&kp);
        p.time += 1;
        assert!(p.verify().is_err());
    }

    #[test]
    fn node_nonce_tamper_passes_preimage() {
        // The node nonce is wire-only; flipping it does not invalidate the
        // signature. Nonce integrity is enforced by the group-nonce XOR.
        let kp = test_keypair(1);
        let mut p = Proposal::build(Stage::Stage0, 1000, 1000);
        p.sign(&kp);
        p.node_nonce = test_hash(99);
        assert!(p.verify().is_ok());
    }
}
