//! Multi-node consensus scenarios, driven deterministically.
//!
//! The harness plays the runner's part for a small cluster: it ticks
//! every node's stage timer in lockstep, routes broadcast proposals,
//! answers execution requests with a deterministic in-process contract
//! (state root and outputs derived from the admitted inputs), and
//! appends committed records to per-node ledger stores.

use hotpocket_consensus::{ConsensusConfig, ConsensusState};
use hotpocket_core::{Action, Event, OutboundMessage, StateMachine};
use hotpocket_ledger::LedgerStore;
use hotpocket_pool::{PoolConfig, PoolState};
use hotpocket_types::test_utils::test_keypair;
use hotpocket_types::{
    hash_outputs, ExecutionResult, FieldHasher, Hash, Proposal, Protocol, Role, Unl, UserInput,
    UserOutput,
};
use std::collections::BTreeSet;
use std::time::Duration;

struct SimNode {
    consensus: ConsensusState,
    pool: PoolState,
    ledger: LedgerStore,
    _dir: tempfile::TempDir,
}

impl SimNode {
    fn new(seed: u8, role: Role, unl: Unl, max_input_ledger_offset: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerStore::open(dir.path()).unwrap();
        let mut consensus = ConsensusState::new(
            test_keypair(seed),
            role,
            unl,
            ConsensusConfig::default(),
        );
        consensus.set_chain_tip(
            ledger.lcl(),
            ledger.primary_shard_tail(),
            ledger.raw_shard_tail(),
            Hash::ZERO,
            Hash::ZERO,
        );
        Self {
            consensus,
            pool: PoolState::new(PoolConfig {
                max_input_ledger_offset,
                ..Default::default()
            }),
            ledger,
            _dir: dir,
        }
    }
}

struct SimCluster {
    nodes: Vec<SimNode>,
    now: Duration,
}

impl SimCluster {
    fn new(seeds: &[u8], threshold: u8, observers: &[u8], max_input_ledger_offset: u32) -> Self {
        let members: BTreeSet<_> = seeds
            .iter()
            .map(|s| test_keypair(*s).public_key())
            .collect();
        let unl = Unl::new(members, threshold).unwrap();
        let nodes = seeds
            .iter()
            .map(|seed| {
                let role = if observers.contains(seed) {
                    Role::Observer
                } else {
                    Role::Validator
                };
                SimNode::new(*seed, role, unl.clone(), max_input_ledger_offset)
            })
            .collect();
        Self {
            nodes,
            now: Duration::from_millis(1_000_000),
        }
    }

    /// Submit a user input to one node.
    fn submit(&mut self, node: usize, input: UserInput) {
        self.deliver(node, Event::UserInputSubmitted { input });
    }

    fn deliver(&mut self, node_index: usize, event: Event) {
        let node = &mut self.nodes[node_index];
        node.consensus.set_now(self.now);
        node.pool.set_now(self.now);
        let mut actions = node.consensus.handle(event.clone());
        actions.extend(node.pool.handle(event));
        self.execute_actions(node_index, actions);
    }

    fn execute_actions(&mut self, node_index: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast {
                    message: OutboundMessage::Proposal(proposal),
                } => self.route_proposal(node_index, *proposal),
                Action::EnqueueInternal { event } => self.deliver(node_index, event),
                Action::StartExecution {
                    seq_no,
                    users,
                    input_hashes,
                    ..
                } => {
                    let result = deterministic_execution(
                        seq_no,
                        &users,
                        &self.nodes[node_index].pool.resolve(&input_hashes),
                        &input_hashes,
                        node_index,
                    );
                    self.deliver(
                        node_index,
                        Event::ExecutionCompleted {
                            result: Box::new(result),
                        },
                    );
                }
                Action::CommitLedger {
                    record,
                    users,
                    input_hashes,
                    outputs,
                } => {
                    let inputs = self.nodes[node_index].pool.resolve(&input_hashes);
                    let node = &mut self.nodes[node_index];
                    node.ledger
                        .append(&record, &users, &inputs, &outputs)
                        .expect("commit chains");
                    node.pool.committed(&input_hashes);
                    let event = Event::LedgerCommitted {
                        record,
                        primary_shard: node.ledger.primary_shard_tail(),
                        raw_shard: node.ledger.raw_shard_tail(),
                    };
                    self.deliver(node_index, event);
                }
                // vfs, timers, sync, and user IO are the runner's
                // business; the harness does not model them.
                _ => {}
            }
        }
    }

    fn route_proposal(&mut self, from: usize, proposal: Proposal) {
        for to in 0..self.nodes.len() {
            if to != from {
                self.deliver(
                    to,
                    Event::ProposalReceived {
                        proposal: proposal.clone(),
                    },
                );
            }
        }
    }

    /// Advance one stage slice on every node.
    fn tick(&mut self) {
        self.now += Duration::from_millis(250);
        for node_index in 0..self.nodes.len() {
            self.deliver(node_index, Event::StageTimer);
        }
    }

    /// Run `rounds` full rounds (five ticks each: four stages plus the
    /// evaluation tick that opens the next round).
    fn run_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds * 5 {
            self.tick();
        }
    }
}

/// Same pure function on every node: the "contract" appends each input
/// digest into the state root and echoes inputs back to their senders.
fn deterministic_execution(
    seq_no: u64,
    _users: &[hotpocket_types::PublicKey],
    inputs: &[UserInput],
    input_hashes: &[Hash],
    node_index: usize,
) -> ExecutionResult {
    let mut hasher = FieldHasher::new();
    hasher.add_bytes(b"state").add_u64(seq_no);
    for hash in input_hashes {
        hasher.add_hash(hash);
    }
    let state_hash = hasher.finish();

    let outputs: Vec<UserOutput> = inputs
        .iter()
        .map(|input| UserOutput {
            pubkey: input.pubkey,
            buffers: vec![input.input_container.clone()],
        })
        .collect();

    let output_hash = hash_outputs(&outputs);
    // Each node signs with its own key; the signature is not part of
    // the quorum comparison.
    let output_sig = test_keypair(node_index as u8 + 1).sign(output_hash.as_bytes());

    ExecutionResult {
        state_hash,
        patch_hash: Hash::digest(b"patch-v1"),
        output_hash,
        output_sig,
        outputs,
        npl_output: None,
    }
}

fn signed_input(seed: u8, payload: &[u8], nonce: u64) -> UserInput {
    let kp = test_keypair(seed);
    UserInput {
        pubkey: kp.public_key(),
        input_container: payload.to_vec(),
        sig: kp.sign(payload),
        protocol: Protocol::Json,
        nonce,
    }
}

#[test]
fn three_node_happy_path() {
    let mut cluster = SimCluster::new(&[1, 2, 3], 67, &[], 10);

    let input = signed_input(10, b"hi", 1);
    let digest = input.digest();
    for node in 0..3 {
        cluster.submit(node, input.clone());
    }

    cluster.run_rounds(2);

    // All three ledgers advanced past seq 1 with identical hashes.
    let lcls: Vec<_> = cluster.nodes.iter().map(|n| n.ledger.lcl()).collect();
    assert!(lcls[0].seq_no >= 1, "no round committed");
    assert_eq!(lcls[0], lcls[1]);
    assert_eq!(lcls[1], lcls[2]);

    // The input landed in every node's inputs table with the same hash.
    for node in &cluster.nodes {
        let rows = node.ledger.get_inputs_by_seq_no(1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hash, digest);
        assert_eq!(node.ledger.read_input_blob(&rows[0]).unwrap(), b"hi");
    }

    // Records chain and agree field by field.
    let records: Vec<_> = cluster
        .nodes
        .iter()
        .map(|n| n.ledger.get_by_seq_no(1).unwrap().unwrap())
        .collect();
    assert_eq!(records[0], records[1]);
    assert_eq!(records[1], records[2]);
    assert_eq!(records[0].prev_ledger_hash, Hash::ZERO);
    assert_eq!(records[0].ledger_hash, records[0].compute_hash());
}

#[test]
fn observer_follows_without_proposing() {
    // Node 3 (index 2) is an observer; {1, 2} still clear the 67%
    // quorum of the three-member UNL... quorum(3, 67) is 3, so use a
    // threshold the two validators can meet.
    let mut cluster = SimCluster::new(&[1, 2, 3], 60, &[3], 10);

    let input = signed_input(11, b"observed", 1);
    for node in 0..3 {
        cluster.submit(node, input.clone());
    }

    cluster.run_rounds(2);

    let lcls: Vec<_> = cluster.nodes.iter().map(|n| n.ledger.lcl()).collect();
    assert!(lcls[0].seq_no >= 1);
    // The observer's ledger advanced in lockstep.
    assert_eq!(lcls[0], lcls[2]);

    // And it truly never proposed: a proposal signed by key 3 would
    // have been routed, which the harness would have recorded in the
    // other nodes' stats as a third contributor. Check directly that
    // the observer role stands.
    assert_eq!(cluster.nodes[2].consensus.role(), Role::Observer);
    assert!(cluster.nodes[2].consensus.stats().rounds_committed >= 1);
}

#[test]
fn byzantine_split_commits_empty_round() {
    let mut cluster = SimCluster::new(&[1, 2, 3], 60, &[], 10);

    // A sees only {x}, B sees only {y}; C sees neither.
    cluster.submit(0, signed_input(20, b"x", 1));
    cluster.submit(1, signed_input(21, b"y", 1));

    cluster.run_rounds(2);

    let lcls: Vec<_> = cluster.nodes.iter().map(|n| n.ledger.lcl()).collect();
    assert!(lcls[0].seq_no >= 1, "split must not stall the round");
    assert_eq!(lcls[0], lcls[1]);
    assert_eq!(lcls[1], lcls[2]);

    // Neither input reached quorum: the round committed with no inputs
    // and the empty-set digest.
    let record = cluster.nodes[0].ledger.get_by_seq_no(1).unwrap().unwrap();
    assert_eq!(record.input_hash, Hash::ZERO);
    assert!(cluster.nodes[0]
        .ledger
        .get_inputs_by_seq_no(1)
        .unwrap()
        .is_empty());
}

#[test]
fn duplicate_input_replay_is_rejected() {
    let mut cluster = SimCluster::new(&[1, 2, 3], 60, &[], 10);

    let first = signed_input(30, b"pay once", 7);
    for node in 0..3 {
        cluster.submit(node, first.clone());
    }
    cluster.run_rounds(2);
    let committed_at = cluster.nodes[0].ledger.lcl().seq_no;
    assert!(committed_at >= 1);

    // Same (pubkey, nonce), different payload, next round.
    let replay = signed_input(30, b"pay twice", 7);
    for node in 0..3 {
        cluster.submit(node, replay.clone());
    }
    cluster.run_rounds(2);

    // No node ever recorded a second row for that (pubkey, nonce).
    for node in &cluster.nodes {
        let mut seen = 0;
        for seq in 1..=node.ledger.lcl().seq_no {
            for row in node.ledger.get_inputs_by_seq_no(seq).unwrap() {
                if row.pubkey == first.pubkey && row.nonce == 7 {
                    seen += 1;
                }
            }
        }
        assert_eq!(seen, 1, "replay must not commit a second row");
    }
}

#[test]
fn ledgers_stay_identical_over_many_rounds() {
    let mut cluster = SimCluster::new(&[1, 2, 3], 60, &[], 10);

    for round in 0u64..4 {
        let input = signed_input(40, format!("round {round}").as_bytes(), round + 1);
        for node in 0..3 {
            cluster.submit(node, input.clone());
        }
        cluster.run_rounds(1);
    }
    cluster.run_rounds(1);

    let tip = cluster.nodes[0].ledger.lcl();
    assert!(tip.seq_no >= 3);
    for node in &cluster.nodes[1..] {
        assert_eq!(node.ledger.lcl(), tip);
    }

    // Hash chain holds on every node (spec invariant 3).
    for node in &cluster.nodes {
        for seq in 1..=tip.seq_no {
            let rec = node.ledger.get_by_seq_no(seq).unwrap().unwrap();
            let prev = node.ledger.get_by_seq_no(seq - 1).unwrap().unwrap();
            assert_eq!(rec.prev_ledger_hash, prev.ledger_hash);
        }
    }
}

#[test]
fn unanimity_threshold_aborts_on_single_dissent() {
    // threshold 100%: all three must agree; node 2's pool never sees
    // the input, so the input set differs below quorum and is dropped,
    // but execution results still agree (inputs merged to the quorum
    // subset). To force a real dissent, keep node 2 from even ticking:
    // its missing stage-3 proposal denies unanimity entirely.
    let mut cluster = SimCluster::new(&[1, 2, 3], 100, &[], 10);

    // Only two nodes participate in ticks.
    for _ in 0..10 {
        cluster.now += Duration::from_millis(250);
        for node_index in [0, 1] {
            cluster.deliver(node_index, Event::StageTimer);
        }
    }

    for node_index in [0, 1] {
        let node = &cluster.nodes[node_index];
        assert_eq!(node.ledger.lcl().seq_no, 0, "unanimity cannot be reached");
        assert!(node.consensus.stats().rounds_aborted >= 1);
    }
}
