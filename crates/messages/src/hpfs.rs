//! State-sync and log-sync wire messages.

use hotpocket_types::{Hash, SeqHash};
use serde::{Deserialize, Serialize};

/// How a responder classified a directory child relative to the
/// requester's hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsEntryResponseType {
    /// Requester's hint matches; nothing to do.
    Matched,
    /// Hashes differ; requester should recurse into this child.
    Mismatched,
    /// The responder does not have this entry; requester should delete it.
    NotAvailable,
}

/// A named child inside a directory, with its subtree hash.
///
/// Appears in requests as a hint ("here is what I already have") and in
/// responses as the authoritative child list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsHashEntry {
    /// Entry name (no path separators).
    pub name: String,
    /// File vs directory.
    pub is_file: bool,
    /// Subtree hash (file hash or directory hash).
    pub hash: Hash,
    /// Responder's classification; `Matched` in requests.
    pub response_type: FsEntryResponseType,
}

/// What a requester already knows, so the responder can answer minimally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HpfsRequestHint {
    /// No prior knowledge.
    None,
    /// Children the requester already has (directory request).
    FsEntries(Vec<FsHashEntry>),
    /// Block hashes the requester already has (file hashmap request).
    FileHashMap(Vec<Hash>),
}

/// Request one node of the versioned filesystem from a peer.
///
/// Three shapes, keyed by `is_file` and `block_id`:
/// dir entry list (`is_file == false`), file hash map (`is_file == true`,
/// `block_id == None`), or a single raw block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpfsRequest {
    /// Which mount (contract fs, ledger fs) this request targets.
    pub mount_id: u32,
    /// Virtual path of the node being requested.
    pub vpath: String,
    /// File vs directory.
    pub is_file: bool,
    /// Block index for raw block requests.
    pub block_id: Option<u32>,
    /// The hash the requester expects at this node; responses are
    /// verified against it.
    pub expected_hash: Hash,
    /// What the requester already has.
    pub hint: HpfsRequestHint,
}

/// Response payload for an [`HpfsRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HpfsResponseContent {
    /// Directory child list.
    FsEntries {
        /// Directory mode bits.
        dir_mode: u32,
        /// Authoritative children with classifications.
        entries: Vec<FsHashEntry>,
    },
    /// Per-block hash map of a file.
    FileHashMap {
        /// Total file length in bytes.
        file_length: u64,
        /// File mode bits.
        file_mode: u32,
        /// One hash per 4 MiB block.
        hashes: Vec<Hash>,
        /// Block ids the responder will push proactively.
        responded_block_ids: Vec<u32>,
    },
    /// One raw file block.
    Block {
        /// Block index within the file.
        block_id: u32,
        /// Raw bytes.
        data: Vec<u8>,
    },
}

/// Answer to an [`HpfsRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpfsResponse {
    /// Mount the response belongs to.
    pub mount_id: u32,
    /// Virtual path of the answered node.
    pub vpath: String,
    /// Echo of the requester's expected hash, used to match request and
    /// response.
    pub expected_hash: Hash,
    /// The payload.
    pub content: HpfsResponseContent,
}

/// Request vfs log records from a full-history peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpfsLogRequest {
    /// Highest sequence number wanted.
    pub target_seq_no: u64,
    /// Joining point: the last record the requester trusts. The server
    /// only serves if its own log matches this record.
    pub min_record_id: SeqHash,
}

/// Log records answering an [`HpfsLogRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpfsLogResponse {
    /// Echo of the request's joining point.
    pub min_record_id: SeqHash,
    /// Raw log records, appendable via the vfs log-append API.
    pub log_record_bytes: Vec<u8>,
}
