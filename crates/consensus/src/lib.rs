//! Stage-driven consensus engine.
//!
//! This crate provides the synchronous consensus state machine that
//! drives HotPocket rounds. A round is four timer slices:
//!
//! - `Stage 0` → collect candidate inputs and announce them
//! - `Stage 1` → lock the quorum-merged input set, start execution
//! - `Stage 2` → publish the execution result roots
//! - `Stage 3` → commit when a quorum shares identical results
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Merging
//!
//! Entering stage k merges the collected stage k−1 proposals from
//! distinct UNL signers (first proposal per signer wins):
//!
//! - `users`, `input_ordered_hashes`: element kept iff proposed by at
//!   least a quorum of signers
//! - `time`: median, rounded to the UNL time granularity, ties low
//! - `group_nonce`: XOR of the contributing signers' node nonces
//! - `state_hash`, `patch_hash`, `output_hash`: carried from the local
//!   execution result once it exists
//!
//! Merges are set-based, so the result is independent of proposal
//! arrival order.
//!
//! # Commit and abort
//!
//! At the round boundary the stage-3 proposals are grouped by
//! `(state_hash, patch_hash, input set, output_hash)`. A group reaching
//! quorum commits the round; a node outside the winning group reverts
//! its RW snapshot and syncs toward the quorum's roots. No quorum at
//! all aborts the round with no sync target.

mod config;
mod merge;
mod round;
mod state;

pub use config::{ConsensusConfig, ConsensusMode};
pub use merge::{hash_of_hash_set, hash_of_user_set, median_time, merge_group_nonce, merge_sets};
pub use round::{RoundOutcome, RoundPhase, RoundState};
pub use state::{ConsensusState, ConsensusStats};
