//! Execution fence results.

use crate::{FieldHasher, Hash, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// Output buffers produced for one user during a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOutput {
    /// Addressed user.
    pub pubkey: PublicKey,
    /// Output buffers in production order.
    pub buffers: Vec<Vec<u8>>,
}

impl UserOutput {
    /// Digest of this user's output set.
    pub fn digest(&self) -> Hash {
        let mut hasher = FieldHasher::new();
        hasher.add_bytes(self.pubkey.as_bytes());
        for buf in &self.buffers {
            hasher.add_u64(buf.len() as u64).add_bytes(buf);
        }
        hasher.finish()
    }
}

/// What the execution fence hands back after a clean contract exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// vfs state root after the contract ran.
    pub state_hash: Hash,
    /// vfs patch (config) root after the contract ran.
    pub patch_hash: Hash,
    /// Deterministic digest of the output set.
    pub output_hash: Hash,
    /// Node signature over `output_hash`.
    pub output_sig: Signature,
    /// Collected outputs, sorted by user key.
    pub outputs: Vec<UserOutput>,
    /// NPL payload the contract emitted this round, if any.
    pub npl_output: Option<Vec<u8>>,
}

/// Deterministic digest over a set of user outputs.
///
/// Outputs fold in user-key order so every node derives the same hash
/// from the same output set.
pub fn hash_outputs(outputs: &[UserOutput]) -> Hash {
    if outputs.is_empty() {
        return Hash::ZERO;
    }
    let mut sorted: Vec<&UserOutput> = outputs.iter().collect();
    sorted.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));

    let mut hasher = FieldHasher::new();
    for out in sorted {
        hasher.add_hash(&out.digest());
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_keypair;

    fn output(seed: u8, bufs: &[&[u8]]) -> UserOutput {
        UserOutput {
            pubkey: test_keypair(seed).public_key(),
            buffers: bufs.iter().map(|b| b.to_vec()).collect(),
        }
    }

    #[test]
    fn empty_outputs_hash_to_zero() {
        assert_eq!(hash_outputs(&[]), Hash::ZERO);
    }

    #[test]
    fn output_hash_is_order_independent() {
        let a = output(1, &[b"x"]);
        let b = output(2, &[b"y", b"z"]);
        assert_eq!(
            hash_outputs(&[a.clone(), b.clone()]),
            hash_outputs(&[b, a])
        );
    }

    #[test]
    fn buffer_boundaries_matter() {
        // ["ab"] and ["a", "b"] must not collide.
        let joined = output(1, &[b"ab"]);
        let split = output(1, &[b"a", b"b"]);
        assert_ne!(joined.digest(), split.digest());
    }
}
