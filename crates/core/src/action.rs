//! Action types for the deterministic state machines.

use crate::{Event, OutboundMessage, TimerId};
use hotpocket_types::{Hash, InputStatus, LedgerRecord, PublicKey, SeqHash, UserOutput};
use std::time::Duration;

/// Actions the state machines want performed.
///
/// Actions are **commands** - they describe something to do. The runner
/// executes them and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every connected peer.
    Broadcast { message: OutboundMessage },

    /// Send a message to one peer, addressed by session id.
    SendTo { session_id: u64, message: OutboundMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Run the contract inside the execution fence.
    ///
    /// The runner resolves the input digests against the pool, acquires
    /// the RW vfs session, spawns the contract, and answers with
    /// `Event::ExecutionCompleted` or `Event::ExecutionFailed`.
    StartExecution {
        /// Sequence number the round will commit as.
        seq_no: u64,
        /// Consensus time of the round, ms.
        time: u64,
        /// Admitted users.
        users: Vec<PublicKey>,
        /// Digests of the admitted inputs, canonically ordered.
        input_hashes: Vec<Hash>,
        /// NPL messages visible to the contract this round.
        npl_messages: Vec<(PublicKey, Vec<u8>)>,
    },

    /// Append the round's record through the ledger writer.
    ///
    /// The runner resolves the input digests to their blobs and answers
    /// with `Event::LedgerCommitted` or `Event::LedgerCommitFailed`.
    CommitLedger {
        /// Sealed record for the round.
        record: LedgerRecord,
        /// Admitted users for the side table.
        users: Vec<PublicKey>,
        /// Digests of the admitted inputs.
        input_hashes: Vec<Hash>,
        /// Execution outputs (blobs go to the raw shard).
        outputs: Vec<UserOutput>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // vfs session control
    // ═══════════════════════════════════════════════════════════════════════
    /// Promote the RW session contents as the new canonical state and
    /// stamp the op-log index with the committed sequence number.
    PromoteState { seq_no: u64 },

    /// Throw away uncommitted RW changes (round abort, failed execution).
    RevertState,

    /// Re-read `patch.cfg` from the vfs and apply the consensus-mutable
    /// config subset (UNL changes included).
    ApplyPatch,

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════
    /// Bring the contract vfs to the quorum's roots via block sync.
    ///
    /// `ledger_tail_hash` is the quorum's advertised ledger tail; the
    /// runner pulls ledger records until the local tail matches it.
    StartStateSync {
        state_hash: Hash,
        patch_hash: Hash,
        ledger_tail_hash: Hash,
    },

    /// Bring the vfs op-log to the target via log sync (full history).
    StartLogSync {
        target: SeqHash,
        ledger_tail_hash: Hash,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // User IO
    // ═══════════════════════════════════════════════════════════════════════
    /// Deliver contract outputs to connected users.
    EmitUserOutputs { seq_no: u64, outputs: Vec<UserOutput> },

    /// Report a submission status to a user.
    EmitInputStatus {
        pubkey: PublicKey,
        input_hash: Hash,
        status: InputStatus,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Role / health
    // ═══════════════════════════════════════════════════════════════════════
    /// Report the round outcome to the role controller.
    NotifyRoundOutcome {
        /// Sequence number the round targeted.
        seq_no: u64,
        /// Whether the round committed.
        committed: bool,
        /// Whether our own proposal was inside the committed quorum.
        contributed: bool,
    },
}

impl Action {
    /// Check if this action requires async I/O.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Action::Broadcast { .. }
                | Action::SendTo { .. }
                | Action::StartExecution { .. }
                | Action::CommitLedger { .. }
                | Action::StartStateSync { .. }
                | Action::StartLogSync { .. }
        )
    }

    /// Check if this is delegated work that answers with a callback event.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::StartExecution { .. } | Action::CommitLedger { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendTo { .. } => "SendTo",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::StartExecution { .. } => "StartExecution",
            Action::CommitLedger { .. } => "CommitLedger",
            Action::PromoteState { .. } => "PromoteState",
            Action::RevertState => "RevertState",
            Action::ApplyPatch => "ApplyPatch",
            Action::StartStateSync { .. } => "StartStateSync",
            Action::StartLogSync { .. } => "StartLogSync",
            Action::EmitUserOutputs { .. } => "EmitUserOutputs",
            Action::EmitInputStatus { .. } => "EmitInputStatus",
            Action::NotifyRoundOutcome { .. } => "NotifyRoundOutcome",
        }
    }
}
