//! Op-log frames.

use hotpocket_types::Hash;
use serde::{Deserialize, Serialize};

/// One record of the vfs operation log.
///
/// Frames are opaque to peers: log sync moves serialized frame runs
/// between nodes and appends them verbatim, so the receiving log stays
/// byte-replayable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    /// Ledger sequence number this record belongs to.
    pub seq_no: u64,
    /// Canonical root hash after the record's operations applied.
    pub root_hash: Hash,
    /// Serialized mutation payload.
    pub data: Vec<u8>,
}

/// Serialize a run of frames for the wire or the log file.
pub(crate) fn encode_frames(frames: &[LogFrame]) -> Vec<u8> {
    bincode::serialize(frames).expect("frames serialize")
}

/// Parse a run of frames.
pub(crate) fn decode_frames(bytes: &[u8]) -> Result<Vec<LogFrame>, bincode::Error> {
    bincode::deserialize(bytes)
}
