//! Ledger record catch-up messages.
//!
//! A node whose vfs was brought forward by state sync still trails the
//! ledger chain itself. It pulls the missing records from a peer in
//! bounded runs, chain-validating each record against its own tail
//! before adoption.

use hotpocket_types::LedgerRecord;
use serde::{Deserialize, Serialize};

/// Records served per response; requesters re-ask for the next run.
pub const LEDGER_SYNC_BATCH: u64 = 512;

/// Request ledger records starting at `min_seq_no`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRequest {
    /// First sequence number wanted (requester's tail + 1).
    pub min_seq_no: u64,
}

/// A run of consecutive ledger records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerResponse {
    /// Records from `min_seq_no` upward, in order.
    pub records: Vec<LedgerRecord>,
}
