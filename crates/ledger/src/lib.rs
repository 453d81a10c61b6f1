//! Sharded, hash-chained ledger storage.
//!
//! Records live in per-shard rocksdb databases (`primary/<shard>/`),
//! input and output blobs in per-shard append-only files
//! (`raw/<shard>/blobs.bin`) addressed by `(offset, size)`. The store
//! enforces the chain: a record only appends when its `seq_no` and
//! `prev_ledger_hash` continue the current tail; a gap means the caller
//! must state-sync before writing again.

mod blob;
mod store;

pub use blob::{BlobStore, BlobView};
pub use store::{LedgerError, LedgerStore};

/// Records per primary shard database.
pub const PRIMARY_SHARD_SIZE: u64 = 16384;

/// Records per raw shard blob file.
pub const RAW_SHARD_SIZE: u64 = 4096;

/// Shard index covering a sequence number.
pub fn shard_seq(seq_no: u64, shard_size: u64) -> u64 {
    seq_no / shard_size
}
