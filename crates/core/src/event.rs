//! Event types for the deterministic state machines.

use hotpocket_messages::NplMessage;
use hotpocket_types::{ExecutionResult, Hash, InputStatus, LedgerRecord, Proposal, PublicKey, SeqHash, UserInput};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same time are processed in priority order. Lower values
/// = higher priority (processed first). Internal events are consequences
/// of prior processing and must land before new external inputs to
/// preserve causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing.
    Internal = 0,
    /// Timers scheduled by the node itself.
    Timer = 1,
    /// Inputs from other nodes.
    Network = 2,
    /// Inputs from users.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machines process events and return actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// A stage slice elapsed; the stage engine advances the round.
    StageTimer,

    /// Periodic cleanup of stale state.
    CleanupTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    //
    // Peer IO verifies signatures, UNL membership, and staleness before
    // delivering these; an event here is already trusted at the
    // transport level. Sender identity comes from the signed payload.
    // ═══════════════════════════════════════════════════════════════════════
    /// A stage proposal from a UNL peer (or echoed from ourselves).
    ProposalReceived { proposal: Proposal },

    /// User inputs relayed for a non-UNL observer.
    NonUnlInputsReceived { inputs: Vec<UserInput> },

    /// A node-party-line message for the current round.
    NplReceived { npl: NplMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Client Requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A user submitted a signed input.
    UserInputSubmitted { input: UserInput },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // Results of delegated work, fed back by the runner.
    // ═══════════════════════════════════════════════════════════════════════
    /// The contract finished cleanly inside the fence.
    ExecutionCompleted { result: Box<ExecutionResult> },

    /// The contract failed: timeout, resource breach, or nonzero exit.
    ExecutionFailed { reason: String },

    /// The ledger writer persisted the round's record.
    ///
    /// Shard tails ride along so proposals can advertise them without
    /// the stage engine touching the store.
    LedgerCommitted {
        record: LedgerRecord,
        primary_shard: SeqHash,
        raw_shard: SeqHash,
    },

    /// The ledger writer could not chain the record (gap or corrupt tail).
    LedgerCommitFailed { reason: String },

    /// An input was admitted into the pool.
    InputAccepted { pubkey: PublicKey, input_hash: Hash },

    /// Block-level state sync reached its target roots.
    StateSyncCompleted { state_hash: Hash, patch_hash: Hash },

    /// State sync gave up after the abandon threshold.
    StateSyncAbandoned,

    /// Log sync archived its target; roots read back from the vfs.
    LogSyncCompleted {
        target: SeqHash,
        state_hash: Hash,
        patch_hash: Hash,
    },

    /// Log sync gave up after the abandon threshold.
    LogSyncAbandoned,
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::ExecutionCompleted { .. }
            | Event::ExecutionFailed { .. }
            | Event::LedgerCommitted { .. }
            | Event::LedgerCommitFailed { .. }
            | Event::InputAccepted { .. }
            | Event::StateSyncCompleted { .. }
            | Event::StateSyncAbandoned
            | Event::LogSyncCompleted { .. }
            | Event::LogSyncAbandoned => EventPriority::Internal,

            Event::StageTimer | Event::CleanupTimer => EventPriority::Timer,

            Event::ProposalReceived { .. }
            | Event::NonUnlInputsReceived { .. }
            | Event::NplReceived { .. } => EventPriority::Network,

            Event::UserInputSubmitted { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::StageTimer => "StageTimer",
            Event::CleanupTimer => "CleanupTimer",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::NonUnlInputsReceived { .. } => "NonUnlInputsReceived",
            Event::NplReceived { .. } => "NplReceived",
            Event::UserInputSubmitted { .. } => "UserInputSubmitted",
            Event::ExecutionCompleted { .. } => "ExecutionCompleted",
            Event::ExecutionFailed { .. } => "ExecutionFailed",
            Event::LedgerCommitted { .. } => "LedgerCommitted",
            Event::LedgerCommitFailed { .. } => "LedgerCommitFailed",
            Event::InputAccepted { .. } => "InputAccepted",
            Event::StateSyncCompleted { .. } => "StateSyncCompleted",
            Event::StateSyncAbandoned => "StateSyncAbandoned",
            Event::LogSyncCompleted { .. } => "LogSyncCompleted",
            Event::LogSyncAbandoned => "LogSyncAbandoned",
        }
    }

    /// Whether a user-facing submission status should be derived from
    /// this event.
    pub fn input_status(&self) -> Option<(PublicKey, InputStatus)> {
        match self {
            Event::InputAccepted { pubkey, .. } => Some((*pubkey, InputStatus::Accepted)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_preserve_causality() {
        assert!(EventPriority::Internal < EventPriority::Timer);
        assert!(EventPriority::Timer < EventPriority::Network);
        assert!(EventPriority::Network < EventPriority::Client);
        assert!(Event::StateSyncAbandoned.is_internal());
        assert_eq!(Event::StageTimer.priority(), EventPriority::Timer);
    }
}
