//! Core types for HotPocket consensus.
//!
//! This crate provides the foundational types used throughout the
//! replication substrate:
//!
//! - **Primitives**: H32 hash, cryptographic keys and signatures
//! - **Identifiers**: SeqHash, ledger sequence numbers
//! - **Consensus types**: Proposal, UserInput, LedgerRecord
//! - **Membership**: the UNL registry and quorum arithmetic
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crates, making it the foundation layer.

mod clock;
mod crypto;
mod execution;
mod hash;
mod input;
mod ledger;
mod proposal;
mod seq_hash;
mod signing;
mod unl;

pub use clock::{epoch_millis, random_nonce};
pub use crypto::{KeyPair, PublicKey, Signature, SignatureError, PUBKEY_LEN, SIG_LEN};
pub use execution::{hash_outputs, ExecutionResult, UserOutput};
pub use hash::{Hash, HexError, HASH_LEN};
pub use input::{InputStatus, Protocol, UserInput};
pub use ledger::{LedgerInputRow, LedgerOutputRow, LedgerRecord};
pub use proposal::{Proposal, Stage};
pub use seq_hash::SeqHash;
pub use signing::{hash_npl_message, hash_proposal, FieldHasher};
pub use unl::{Unl, UnlError, MAX_THRESHOLD, MIN_THRESHOLD};

/// The role a node plays in consensus.
///
/// Observers follow the UNL's rounds without proposing; validators
/// propose. Promotion and demotion are driven by the role controller in
/// the node crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Follows consensus, never proposes.
    Observer,
    /// Full participant: proposes and contributes to quorum.
    Validator,
}

impl Role {
    /// Whether this role broadcasts proposals.
    pub fn proposes(&self) -> bool {
        matches!(self, Role::Validator)
    }
}

/// Combine the patch (config) hash and the state hash into the vfs root.
///
/// The root anchors consensus: two nodes agree on contract state iff
/// their roots are equal.
pub fn vfs_root_hash(patch_hash: &Hash, state_hash: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(patch_hash.as_bytes());
    hasher.update(state_hash.as_bytes());
    Hash::from(*hasher.finalize().as_bytes())
}

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Create a deterministic keypair from a seed byte.
    pub fn test_keypair(seed: u8) -> KeyPair {
        KeyPair::from_seed([seed; 32])
    }

    /// Create a test hash from a seed byte.
    pub fn test_hash(seed: u8) -> Hash {
        Hash::from([seed; 32])
    }

    /// Build a UNL from seed bytes with the given threshold percent.
    pub fn test_unl(seeds: &[u8], threshold: u8) -> Unl {
        Unl::new(
            seeds.iter().map(|s| test_keypair(*s).public_key()).collect(),
            threshold,
        )
        .expect("valid threshold")
    }
}
