//! Versioned Merkle filesystem interface.
//!
//! Contract state lives on a content-addressed filesystem whose root
//! hash is the consensus anchor. This crate defines the mount
//! operation surface ([`VfsMount`]), a directory-backed implementation
//! ([`DirFs`]) good enough to run a node without the external daemon,
//! and an actor wrapper ([`VfsClient`]) that owns the mount and serves
//! typed request/reply calls so no caller ever holds a lock across a
//! filesystem operation.
//!
//! # Hash model
//!
//! - block hash: blake3 of the block bytes (4 MiB blocks)
//! - file hash: XOR-fold of `H(block_index || block_hash)` per block
//! - dir hash: XOR-fold of `H(name || child_hash)` per child
//!
//! XOR keeps every update O(changed subtree): a parent recomputes by
//! folding out the old child hash and folding in the new one.

mod actor;
mod dir_fs;
mod log;
mod mount;

pub use actor::{VfsClient, VfsRequest};
pub use dir_fs::DirFs;
pub use log::LogFrame;
pub use mount::{ChildHashNode, VfsError, VfsMount};

/// Block size for file-level hashing and block transfer.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// The built-in session name for the RW session.
pub const RW_SESSION_NAME: &str = "rw";

/// Virtual path of the contract state tree.
pub const STATE_DIR_PATH: &str = "/state";

/// Virtual path of the consensus-mutable patch config.
pub const PATCH_FILE_PATH: &str = "/patch.cfg";
