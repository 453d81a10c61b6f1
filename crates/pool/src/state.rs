//! Pool state.

use hotpocket_core::{Action, Event, OutboundMessage, StateMachine};
use hotpocket_types::{Hash, InputStatus, PublicKey, UserInput};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Pool tunables, sourced from the round-limits config section.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Byte budget for admitted inputs per round.
    pub user_input_bytes: u64,
    /// Rounds a `(pubkey, nonce)` pair stays un-replayable.
    pub max_input_ledger_offset: u32,
    /// Whether admitted inputs from non-UNL-visible users are
    /// re-broadcast for UNL observation.
    pub forward_non_unl: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            user_input_bytes: 10 * 1024 * 1024,
            max_input_ledger_offset: 10,
            forward_non_unl: false,
        }
    }
}

/// An input waiting to be offered to a round.
#[derive(Debug)]
struct PoolEntry {
    input: UserInput,
}

/// Input pool state machine.
///
/// Single-writer admission: the runner serializes events, so plain maps
/// suffice (the shared-read side is the candidate snapshot the stage
/// engine receives through `InputAccepted` events).
pub struct PoolState {
    config: PoolConfig,

    /// Admitted inputs keyed by digest.
    pool: BTreeMap<Hash, PoolEntry>,

    /// Bytes admitted toward the current round's budget.
    round_bytes: u64,

    /// Sliding replay window: one `(pubkey, nonce)` set per recent
    /// ledger, newest at the back.
    replay_window: VecDeque<HashSet<(PublicKey, u64)>>,

    /// Keys admitted to the pool but not yet committed; they count
    /// against replays too.
    pending_keys: HashSet<(PublicKey, u64)>,

    #[allow(dead_code)]
    now: Duration,
}

impl PoolState {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pool: BTreeMap::new(),
            round_bytes: 0,
            replay_window: VecDeque::new(),
            pending_keys: HashSet::new(),
            now: Duration::ZERO,
        }
    }

    /// Resolve admitted inputs by digest, in the given order.
    ///
    /// Used by the runner to materialize the stage engine's locked input
    /// set for execution and ledger persistence. Unknown digests are
    /// skipped; the caller decides whether that is fatal.
    pub fn resolve(&self, hashes: &[Hash]) -> Vec<UserInput> {
        hashes
            .iter()
            .filter_map(|h| self.pool.get(h).map(|e| e.input.clone()))
            .collect()
    }

    /// Number of inputs currently pooled.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Admit one input, returning its status and follow-up actions.
    #[instrument(skip(self, input), fields(user = ?input.pubkey, nonce = input.nonce))]
    fn admit(&mut self, input: UserInput, from_mesh: bool) -> Vec<Action> {
        let digest = input.digest();
        let key = input.replay_key();

        let status = if input.verify().is_err() {
            debug!("Input signature rejected");
            InputStatus::BadSignature
        } else if self.is_replay(&key) || self.pool.contains_key(&digest) {
            debug!("Input replay rejected");
            InputStatus::AlreadySubmitted
        } else if self.round_bytes + input.size() as u64 > self.config.user_input_bytes {
            debug!(
                round_bytes = self.round_bytes,
                budget = self.config.user_input_bytes,
                "Round input budget exhausted"
            );
            InputStatus::QuotaExceeded
        } else {
            InputStatus::Accepted
        };

        let mut actions = vec![Action::EmitInputStatus {
            pubkey: input.pubkey,
            input_hash: digest,
            status,
        }];

        if status != InputStatus::Accepted {
            return actions;
        }

        self.round_bytes += input.size() as u64;
        self.pending_keys.insert(key);

        // Non-UNL users' inputs must reach the UNL to be admitted into a
        // round; re-broadcast unless this copy already came off the mesh.
        if self.config.forward_non_unl && !from_mesh {
            actions.push(Action::Broadcast {
                message: OutboundMessage::NonUnlProposal {
                    user_inputs: vec![input.clone()],
                },
            });
        }

        actions.push(Action::EnqueueInternal {
            event: Event::InputAccepted {
                pubkey: input.pubkey,
                input_hash: digest,
            },
        });

        trace!(pool_size = self.pool.len() + 1, "Input admitted");
        self.pool.insert(digest, PoolEntry { input });

        actions
    }

    /// Whether `(pubkey, nonce)` was seen inside the window.
    fn is_replay(&self, key: &(PublicKey, u64)) -> bool {
        self.pending_keys.contains(key) || self.replay_window.iter().any(|s| s.contains(key))
    }

    /// Fold a committed round into the replay window and evict its
    /// inputs from the pool.
    fn on_ledger_committed(&mut self, committed_inputs: &[Hash]) {
        let mut committed_keys = HashSet::new();
        for hash in committed_inputs {
            if let Some(entry) = self.pool.remove(hash) {
                let key = entry.input.replay_key();
                self.pending_keys.remove(&key);
                committed_keys.insert(key);
            }
        }

        self.replay_window.push_back(committed_keys);
        while self.replay_window.len() > self.config.max_input_ledger_offset as usize {
            self.replay_window.pop_front();
        }

        // The byte budget resets each round; carried-over inputs count
        // again when re-offered.
        self.round_bytes = self
            .pool
            .values()
            .map(|e| e.input.size() as u64)
            .sum();
    }
}

impl StateMachine for PoolState {
    fn set_now(&mut self, now: Duration) {
        self.now = now;
    }

    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::UserInputSubmitted { input } => self.admit(input, false),
            Event::NonUnlInputsReceived { inputs } => inputs
                .into_iter()
                .flat_map(|input| self.admit(input, true))
                .collect(),
            Event::LedgerCommitted { record: _, .. } => {
                // The runner invokes `committed()` with the admitted set;
                // the event alone carries no input list.
                vec![]
            }
            _ => vec![],
        }
    }
}

impl PoolState {
    /// Notify the pool of the committed input set (runner callback,
    /// alongside the `LedgerCommitted` event).
    pub fn committed(&mut self, committed_inputs: &[Hash]) {
        self.on_ledger_committed(committed_inputs);
    }

    /// Swap the tunables after a patch-config apply (between rounds).
    pub fn set_config(&mut self, config: PoolConfig) {
        while self.replay_window.len() > config.max_input_ledger_offset as usize {
            self.replay_window.pop_front();
        }
        self.config = config;
    }
}
