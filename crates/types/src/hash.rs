//! 32-byte blake3 digest used everywhere a content address is needed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a hash in bytes.
pub const HASH_LEN: usize = 32;

/// A 32-byte blake3 digest.
///
/// Total-ordered by lexicographic byte compare and XOR-combinable, which
/// is what the vfs uses to fold child hashes into directory roots and
/// what consensus uses to fold node nonces into the group nonce.
///
/// The all-zero hash is the sentinel for "empty".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// The zero hash ("empty" sentinel).
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    /// Hash arbitrary bytes with blake3.
    pub fn digest(data: &[u8]) -> Self {
        Hash(*blake3::hash(data).as_bytes())
    }

    /// View the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Whether this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    /// XOR-fold another hash into this one.
    ///
    /// XOR is commutative and associative, so folding a set of hashes
    /// yields the same result regardless of iteration order.
    pub fn xor(&mut self, other: &Hash) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s).map_err(|_| HexError::InvalidHex)?;
        let arr: [u8; HASH_LEN] = bytes.try_into().map_err(|_| HexError::WrongLength)?;
        Ok(Hash(arr))
    }

    /// Hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Error parsing a hash from hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    /// Not valid hexadecimal.
    #[error("invalid hex string")]
    InvalidHex,
    /// Decoded to the wrong number of bytes.
    #[error("expected {HASH_LEN} bytes")]
    WrongLength,
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::ZERO
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form keeps log lines readable.
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
