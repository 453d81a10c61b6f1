//! Wall clock and per-round nonce helpers.
//!
//! State machines never call these directly; the runner stamps time into
//! events and draws nonces at round start, keeping the machines
//! deterministic.

use crate::Hash;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A fresh 32-byte random nonce (node nonce, peer challenge seed).
pub fn random_nonce() -> Hash {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Hash::from(bytes)
}
