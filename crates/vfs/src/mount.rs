//! The mount operation surface.

use hotpocket_types::Hash;
use std::path::PathBuf;

/// Errors from mount operations.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// Underlying filesystem failure.
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The virtual path does not exist in the session.
    #[error("no such vpath: {0}")]
    NotFound(String),
    /// A session name that was never started (or already stopped).
    #[error("unknown session: {0}")]
    UnknownSession(String),
    /// Promote called with no RW consumers holding the session.
    #[error("rw session not held")]
    RwNotHeld,
    /// The op-log or its index is inconsistent.
    #[error("log corrupt: {0}")]
    LogCorrupt(String),
}

impl VfsError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        VfsError::Io {
            path: path.into(),
            source,
        }
    }
}

/// One child of a directory, with its subtree hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildHashNode {
    /// Entry name.
    pub name: String,
    /// File vs directory.
    pub is_file: bool,
    /// Subtree hash.
    pub hash: Hash,
}

/// A mounted versioned filesystem.
///
/// Implementations are internally synchronized; no method may be called
/// while the caller holds an unrelated lock (lock-ordering rule: no
/// lock is held across a vfs call).
pub trait VfsMount: Send + Sync {
    /// Identifier used in sync requests to address this mount.
    fn mount_id(&self) -> u32;

    /// Take (or share) the RW session. Reference-counted: the session
    /// materializes on the first acquire and is dropped un-promoted on
    /// the last release.
    fn acquire_rw(&self) -> Result<(), VfsError>;

    /// Give the RW session back.
    fn release_rw(&self) -> Result<(), VfsError>;

    /// Publish the RW session contents as the new canonical state.
    fn promote_rw(&self) -> Result<(), VfsError>;

    /// Throw away RW changes, resetting the session to canonical state.
    fn revert_rw(&self) -> Result<(), VfsError>;

    /// Open a named read-only snapshot of the canonical state.
    fn start_ro(&self, name: &str, with_hashmap: bool) -> Result<(), VfsError>;

    /// Close a read-only snapshot.
    fn stop_ro(&self, name: &str) -> Result<(), VfsError>;

    /// Subtree hash at `vpath` inside a session.
    fn get_hash(&self, session: &str, vpath: &str) -> Result<Hash, VfsError>;

    /// Per-block hashes of a file.
    fn get_file_block_hashes(&self, session: &str, vpath: &str) -> Result<Vec<Hash>, VfsError>;

    /// Children of a directory with their subtree hashes.
    fn get_dir_children_hashes(
        &self,
        session: &str,
        vpath: &str,
    ) -> Result<Vec<ChildHashNode>, VfsError>;

    /// Physical path of `vpath` inside a session, for direct file IO.
    fn physical_path(&self, session: &str, vpath: &str) -> PathBuf;

    /// Cached parent hash for a vpath (zero when never set).
    fn get_parent_hash(&self, vpath: &str) -> Hash;

    /// Update the cached parent hash for a vpath.
    fn set_parent_hash(&self, vpath: &str, hash: Hash);

    // ── op-log (full history) ────────────────────────────────────────────

    /// Stamp the log index: the canonical root now corresponds to
    /// `seq_no`.
    fn update_log_index(&self, seq_no: u64) -> Result<(), VfsError>;

    /// Drop every log record with sequence number greater than `seq_no`.
    fn truncate_log(&self, seq_no: u64) -> Result<(), VfsError>;

    /// Serialized log records with `min_seq < seq_no <= max_seq`.
    fn read_logs(&self, min_seq: u64, max_seq: u64) -> Result<Vec<u8>, VfsError>;

    /// Append records previously produced by [`VfsMount::read_logs`] on
    /// another node.
    fn append_logs(&self, bytes: &[u8]) -> Result<(), VfsError>;

    /// Highest sequence number in the log index (0 when empty).
    fn last_log_seq_no(&self) -> Result<u64, VfsError>;

    /// Root hash the index recorded at `seq_no`, if present.
    fn log_hash_by_seq_no(&self, seq_no: u64) -> Result<Option<Hash>, VfsError>;
}
