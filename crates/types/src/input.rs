//! User inputs.

use crate::{Hash, PublicKey, Signature, SignatureError};
use serde::{Deserialize, Serialize};

/// Framing protocol a user connection negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// JSON object framing.
    Json,
    /// BSON document framing.
    Bson,
}

/// Outcome of an input submission, reported back to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputStatus {
    /// Accepted into the pool; will be offered to the next round.
    Accepted,
    /// Same (pubkey, nonce) already seen inside the replay window.
    AlreadySubmitted,
    /// Signature did not verify against the user key.
    BadSignature,
    /// The round's input byte budget is exhausted.
    QuotaExceeded,
}

/// A signed input submitted by a user.
///
/// Identity inside the replay window is `(pubkey, nonce)`; identity for
/// consensus ordering is the blake3 digest of the container bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInput {
    /// Submitting user.
    pub pubkey: PublicKey,
    /// Opaque input payload fed to the contract.
    pub input_container: Vec<u8>,
    /// User signature over the container bytes.
    pub sig: Signature,
    /// Framing the user connection negotiated.
    pub protocol: Protocol,
    /// User-chosen replay-protection nonce.
    pub nonce: u64,
}

impl UserInput {
    /// Digest of the container bytes: the input's consensus identity.
    pub fn digest(&self) -> Hash {
        Hash::digest(&self.input_container)
    }

    /// Replay-window identity.
    pub fn replay_key(&self) -> (PublicKey, u64) {
        (self.pubkey, self.nonce)
    }

    /// Verify the user's signature over the container.
    pub fn verify(&self) -> Result<(), SignatureError> {
        self.pubkey.verify(&self.input_container, &self.sig)
    }

    /// Wire size used against the round byte budget.
    pub fn size(&self) -> usize {
        self.input_container.len()
    }
}
