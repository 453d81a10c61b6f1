//! Ed25519 keys and signatures.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a public key in bytes.
pub const PUBKEY_LEN: usize = 32;

/// Length of a signature in bytes.
pub const SIG_LEN: usize = 64;

/// Error verifying or decoding signature material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The signature does not verify against the key and message.
    #[error("signature verification failed")]
    Invalid,
    /// The public key bytes do not form a valid curve point.
    #[error("malformed public key")]
    MalformedKey,
}

/// An Ed25519 public key.
///
/// Doubles as the node identity: UNL membership, ledger rows, and user
/// records are all keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBKEY_LEN]);

impl PublicKey {
    /// View the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.0
    }

    /// Verify `sig` over `message`.
    pub fn verify(&self, message: &[u8], sig: &Signature) -> Result<(), SignatureError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::MalformedKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
        key.verify(message, &sig)
            .map_err(|_| SignatureError::Invalid)
    }

    /// Hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex (as stored in `hp.cfg`).
    pub fn from_hex(s: &str) -> Result<Self, crate::HexError> {
        let bytes = hex::decode(s).map_err(|_| crate::HexError::InvalidHex)?;
        let arr: [u8; PUBKEY_LEN] = bytes.try_into().map_err(|_| crate::HexError::WrongLength)?;
        Ok(PublicKey(arr))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An Ed25519 signature.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_sig")] pub [u8; SIG_LEN]);

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}
impl Eq for Signature {}

impl Signature {
    /// View the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIG_LEN] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", &hex::encode(&self.0[..4]))
    }
}

/// A signing keypair.
///
/// Wraps the dalek signing key so the rest of the codebase never touches
/// the curve library directly.
#[derive(Clone)]
pub struct KeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// The secret seed bytes (persisted hex-encoded in `hp.cfg`).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

// Never leak key material through Debug.
impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?})", self.public_key())
    }
}

mod serde_sig {
    use super::SIG_LEN;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; SIG_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; SIG_LEN], D::Error> {
        let v: Vec<u8> = serde_bytes_vec(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }

    fn serde_bytes_vec<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = Vec<u8>;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("bytes")
            }
            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }
            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element()? {
                    out.push(b);
                }
                Ok(out)
            }
        }
        d.deserialize_bytes(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::from_seed([7u8; 32]);
        let sig = kp.sign(b"message");
        assert!(kp.public_key().verify(b"message", &sig).is_ok());
        assert_eq!(
            kp.public_key().verify(b"other", &sig),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn wrong_key_rejects() {
        let a = KeyPair::from_seed([1u8; 32]);
        let b = KeyPair::from_seed([2u8; 32]);
        let sig = a.sign(b"payload");
        assert!(b.public_key().verify(b"payload", &sig).is_err());
    }

    #[test]
    fn seed_round_trip() {
        let kp = KeyPair::from_seed([9u8; 32]);
        let again = KeyPair::from_seed(kp.secret_bytes());
        assert_eq!(kp.public_key(), again.public_key());
    }

    #[test]
    fn pubkey_hex_round_trip() {
        let pk = KeyPair::from_seed([3u8; 32]).public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
    }
}
