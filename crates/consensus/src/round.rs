//! Per-round workspace.

use hotpocket_types::{ExecutionResult, Hash, PublicKey, Stage};
use std::collections::BTreeSet;
use std::time::Duration;

/// Where the engine currently is inside (or between) rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Between rounds; the next stage tick opens a round.
    Idle,
    /// Inside a round, at the given stage.
    Stage(Stage),
    /// Stage 3 evaluated to a commit; waiting on the ledger writer.
    Committing,
}

/// How a round ended; reported to the role controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Quorum reached, ledger appended.
    Committed {
        /// Whether our own stage-3 proposal was inside the quorum group.
        contributed: bool,
    },
    /// No quorum group, or we fell outside it.
    Aborted,
}

/// The mutable workspace of one consensus round.
///
/// Owned exclusively by the stage engine; created when a round opens
/// and destroyed when stage 3 commits or the round aborts.
#[derive(Debug)]
pub struct RoundState {
    /// Ledger sequence number this round is trying to close.
    pub target_seq_no: u64,
    /// Wall-clock offset the round opened at.
    pub started_at: Duration,
    /// Our fresh nonce for the round.
    pub node_nonce: Hash,
    /// Merged users after the latest stage transition.
    pub merged_users: BTreeSet<PublicKey>,
    /// Merged input digests after the latest stage transition.
    pub merged_inputs: BTreeSet<Hash>,
    /// Merged consensus time.
    pub merged_time: u64,
    /// XOR of contributing node nonces.
    pub group_nonce: Hash,
    /// Execution fence result, once the contract finished.
    pub execution: Option<ExecutionResult>,
    /// Set when the fence reported failure; stage 2+ proposals then omit
    /// output fields.
    pub execution_failed: bool,
    /// Whether the execution fence has been started.
    pub execution_started: bool,
    /// NPL payloads observed this round, fed to the next execution.
    pub npl_messages: Vec<(PublicKey, Vec<u8>)>,
}

impl RoundState {
    /// Open a round targeting `seq_no`.
    pub fn open(target_seq_no: u64, node_nonce: Hash, started_at: Duration) -> Self {
        Self {
            target_seq_no,
            started_at,
            node_nonce,
            merged_users: BTreeSet::new(),
            merged_inputs: BTreeSet::new(),
            merged_time: 0,
            group_nonce: Hash::ZERO,
            execution: None,
            execution_failed: false,
            execution_started: false,
            npl_messages: Vec::new(),
        }
    }

    /// Whether the fence produced a usable result.
    pub fn has_execution_result(&self) -> bool {
        self.execution.is_some() && !self.execution_failed
    }
}
