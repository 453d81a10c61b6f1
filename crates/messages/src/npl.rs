//! Node-party-line messages.

use hotpocket_types::{hash_npl_message, KeyPair, PublicKey, SeqHash, Signature};
use serde::{Deserialize, Serialize};

/// A node-party-line message: contract-visible gossip between UNL nodes.
///
/// Bound to a round via `lcl_id`; stale rounds are dropped at dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NplMessage {
    /// Originating node.
    pub pubkey: PublicKey,
    /// Signature over `hash(data, lcl_id)`.
    pub sig: Signature,
    /// Opaque contract payload.
    pub data: Vec<u8>,
    /// The last closed ledger this message belongs to.
    pub lcl_id: SeqHash,
}

impl NplMessage {
    /// Create and sign an NPL message with the node key.
    pub fn sign_new(key: &KeyPair, data: Vec<u8>, lcl_id: SeqHash) -> Self {
        let hash = hash_npl_message(&data, &lcl_id);
        Self {
            pubkey: key.public_key(),
            sig: key.sign(hash.as_bytes()),
            data,
            lcl_id,
        }
    }

    /// Verify the signature over the payload/round preimage.
    pub fn verify(&self) -> bool {
        let hash = hash_npl_message(&self.data, &self.lcl_id);
        self.pubkey.verify(hash.as_bytes(), &self.sig).is_ok()
    }
}
