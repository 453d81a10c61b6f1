//! Full-history log sync.
//!
//! Walks the ledger and the vfs log index back to their last agreeing
//! point (the joining point), truncates the log there, then pulls the
//! missing records from a peer whose log provably contains the joining
//! point.

use crate::ABANDON_THRESHOLD;
use hotpocket_ledger::LedgerStore;
use hotpocket_messages::{HpfsLogRequest, HpfsLogResponse};
use hotpocket_types::{vfs_root_hash, Hash, SeqHash};
use hotpocket_vfs::VfsMount;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a tick or response produced.
#[derive(Debug)]
pub enum LogSyncOutcome {
    /// Send this request to a random full-history UNL peer.
    Request(HpfsLogRequest),
    /// The log reached the target; roots read back from the tree.
    Completed {
        target: SeqHash,
        state_hash: Hash,
        patch_hash: Hash,
    },
    /// Too many unanswered resubmissions; attempt dropped.
    Abandoned,
}

/// Log record synchronizer for full-history nodes.
pub struct LogSyncManager {
    mount: Arc<dyn VfsMount>,
    ledger: Arc<LedgerStore>,
    resubmit_timeout: Duration,

    /// Genesis point: always servable, always a valid joining point.
    genesis: SeqHash,

    target: Option<SeqHash>,
    /// The verified joining point we request from.
    min_record: SeqHash,
    requested_on: Option<Duration>,
    submissions: u32,
}

impl LogSyncManager {
    /// Create a manager over the contract mount and the ledger.
    pub fn new(
        mount: Arc<dyn VfsMount>,
        ledger: Arc<LedgerStore>,
        resubmit_timeout: Duration,
    ) -> Self {
        let genesis = SeqHash::new(0, vfs_root_hash(&Hash::ZERO, &Hash::ZERO));
        Self {
            mount,
            ledger,
            resubmit_timeout,
            genesis,
            target: None,
            min_record: SeqHash::genesis(),
            requested_on: None,
            submissions: 0,
        }
    }

    /// Whether an attempt is in flight.
    pub fn is_syncing(&self) -> bool {
        self.target.is_some()
    }

    /// Begin converging the log toward `target`.
    ///
    /// Returns `Some(outcome)` immediately when the node turns out to
    /// already hold the target.
    pub fn set_target(&mut self, target: SeqHash) -> Option<LogSyncOutcome> {
        if self.target == Some(target) {
            return None;
        }

        match self.verified_min_record(target) {
            MinRecord::InSync => {
                return Some(self.complete(target));
            }
            MinRecord::From(min) => {
                info!(%target, min = %min, "Log sync starting");
                self.target = Some(target);
                self.min_record = min;
                self.requested_on = None;
                self.submissions = 0;
            }
            MinRecord::Failed => {
                warn!(%target, "Could not determine log joining point");
            }
        }
        None
    }

    /// Drive submissions and timeouts.
    pub fn tick(&mut self, now: Duration) -> Vec<LogSyncOutcome> {
        let Some(target) = self.target else {
            return vec![];
        };

        let due = match self.requested_on {
            None => true,
            Some(at) => now.saturating_sub(at) > self.resubmit_timeout,
        };
        if !due {
            return vec![];
        }
        if self.submissions >= ABANDON_THRESHOLD {
            warn!("Resubmission threshold exceeded, abandoning log sync");
            self.reset();
            return vec![LogSyncOutcome::Abandoned];
        }

        self.requested_on = Some(now);
        self.submissions += 1;
        debug!(
            target = target.seq_no,
            min = self.min_record.seq_no,
            submissions = self.submissions,
            "Submitting log sync request"
        );
        vec![LogSyncOutcome::Request(HpfsLogRequest {
            target_seq_no: target.seq_no,
            min_record_id: self.min_record,
        })]
    }

    /// Apply a peer's log records.
    pub fn on_response(&mut self, response: HpfsLogResponse) -> Vec<LogSyncOutcome> {
        let Some(target) = self.target else {
            return vec![];
        };

        // Only append runs that start exactly at our joining point.
        if response.min_record_id != self.min_record {
            debug!(
                theirs = %response.min_record_id,
                ours = %self.min_record,
                "Invalid joining point in log response"
            );
            return vec![];
        }

        if let Err(e) = self.mount.append_logs(&response.log_record_bytes) {
            warn!(error = %e, "Persisting log records failed");
            return vec![];
        }

        match self.verified_min_record(target) {
            MinRecord::InSync => vec![self.complete(target)],
            MinRecord::From(min) => {
                // Progress; request the next run from the new point.
                self.min_record = min;
                self.requested_on = None;
                vec![]
            }
            MinRecord::Failed => vec![],
        }
    }

    /// Serve a peer's log request. A node only serves when its own log
    /// provably contains the requested joining point; genesis is always
    /// servable.
    pub fn serve(&self, request: &HpfsLogRequest) -> Option<HpfsLogResponse> {
        if request.min_record_id != self.genesis {
            let ours = self
                .mount
                .log_hash_by_seq_no(request.min_record_id.seq_no)
                .ok()??;
            if ours != request.min_record_id.hash {
                debug!(requested = %request.min_record_id, "Joining point not in our log");
                return None;
            }
        }

        let bytes = self
            .mount
            .read_logs(request.min_record_id.seq_no, request.target_seq_no)
            .ok()?;
        Some(HpfsLogResponse {
            min_record_id: request.min_record_id,
            log_record_bytes: bytes,
        })
    }

    // ── joining point ────────────────────────────────────────────────────

    fn complete(&mut self, target: SeqHash) -> LogSyncOutcome {
        let (state_hash, patch_hash) = self
            .mount
            .get_hash("ro", hotpocket_vfs::STATE_DIR_PATH)
            .and_then(|s| {
                self.mount
                    .get_hash("ro", hotpocket_vfs::PATCH_FILE_PATH)
                    .map(|p| (s, p))
            })
            .unwrap_or((Hash::ZERO, Hash::ZERO));

        // Target archived: refresh the cached parent hash once.
        self.mount
            .set_parent_hash(hotpocket_vfs::STATE_DIR_PATH, state_hash);
        info!(%target, "Log sync target archived");
        self.reset();
        LogSyncOutcome::Completed {
            target,
            state_hash,
            patch_hash,
        }
    }

    fn reset(&mut self) {
        self.target = None;
        self.requested_on = None;
        self.submissions = 0;
    }

    /// The joining-point decision tree.
    fn verified_min_record(&self, target: SeqHash) -> MinRecord {
        let last_index_seq = match self.mount.last_log_seq_no() {
            Ok(seq) => seq,
            Err(e) => {
                warn!(error = %e, "Reading log index failed");
                return MinRecord::Failed;
            }
        };
        let last_index_hash = match self.mount.log_hash_by_seq_no(last_index_seq) {
            Ok(Some(hash)) => hash,
            Ok(None) => self.genesis.hash,
            Err(_) => return MinRecord::Failed,
        };
        let last_from_index = SeqHash::new(last_index_seq, last_index_hash);

        // Target already archived: the log covers the target height and
        // the tree sits at the target root.
        if last_index_seq >= target.seq_no && self.current_root() == Some(target.hash) {
            return MinRecord::InSync;
        }

        let lcl = self.ledger.lcl();
        // Either side at genesis: request the full log.
        if last_from_index.seq_no == 0 || lcl.seq_no == 0 {
            return MinRecord::From(self.genesis);
        }

        let last_from_ledger = match self.ledger_root_at(lcl.seq_no) {
            Some(hash) => SeqHash::new(lcl.seq_no, hash),
            None => return MinRecord::Failed,
        };

        if last_from_index == last_from_ledger {
            // Heads agree; are we already at the target root?
            match self.current_root() {
                Some(root) if root == target.hash => MinRecord::InSync,
                Some(_) => {
                    // Stray records may follow the last index update.
                    if self.mount.truncate_log(last_from_ledger.seq_no).is_err() {
                        return MinRecord::Failed;
                    }
                    MinRecord::From(last_from_ledger)
                }
                None => MinRecord::Failed,
            }
        } else if last_from_index.seq_no == last_from_ledger.seq_no {
            // Same height, different roots: forked.
            self.joining_point_for_fork(last_from_index.seq_no.saturating_sub(1))
        } else if last_from_ledger.seq_no > last_from_index.seq_no {
            // Ledger ahead of the log: trust the index head if the
            // ledger agrees with it, else walk back.
            match self.ledger_root_at(last_from_index.seq_no) {
                Some(root) if root == last_from_index.hash => MinRecord::From(last_from_index),
                Some(_) => self.joining_point_for_fork(last_from_index.seq_no.saturating_sub(1)),
                None => MinRecord::Failed,
            }
        } else {
            // Log ahead of the ledger: walk back from the ledger head.
            self.joining_point_for_fork(last_from_ledger.seq_no.saturating_sub(1))
        }
    }

    /// Walk backwards until the ledger's root and the log index agree.
    fn joining_point_for_fork(&self, starting_point: u64) -> MinRecord {
        if starting_point == 0 {
            if self.mount.truncate_log(0).is_err() {
                return MinRecord::Failed;
            }
            return MinRecord::From(self.genesis);
        }

        let mut seq_no = starting_point;
        loop {
            let ledger_root = match self.ledger_root_at(seq_no) {
                Some(root) => root,
                None => return MinRecord::Failed,
            };
            let index_root = match self.mount.log_hash_by_seq_no(seq_no) {
                Ok(root) => root,
                Err(_) => return MinRecord::Failed,
            };

            if index_root == Some(ledger_root) {
                // Joining point found; drop everything after it.
                if self.mount.truncate_log(seq_no).is_err() {
                    return MinRecord::Failed;
                }
                return MinRecord::From(SeqHash::new(seq_no, ledger_root));
            }

            if seq_no == 1 {
                // No agreement down to genesis: start from scratch.
                if self.mount.truncate_log(0).is_err() {
                    return MinRecord::Failed;
                }
                return MinRecord::From(self.genesis);
            }
            seq_no -= 1;
        }
    }

    /// `H(config_hash, state_hash)` of the ledger record at `seq_no`.
    fn ledger_root_at(&self, seq_no: u64) -> Option<Hash> {
        match self.ledger.get_by_seq_no(seq_no) {
            Ok(Some(record)) => Some(vfs_root_hash(&record.config_hash, &record.state_hash)),
            Ok(None) => None,
            Err(e) => {
                warn!(seq_no, error = %e, "Reading ledger root failed");
                None
            }
        }
    }

    fn current_root(&self) -> Option<Hash> {
        let state = self.mount.get_hash("ro", hotpocket_vfs::STATE_DIR_PATH).ok()?;
        let patch = self.mount.get_hash("ro", hotpocket_vfs::PATCH_FILE_PATH).ok()?;
        Some(vfs_root_hash(&patch, &state))
    }
}

enum MinRecord {
    /// Already at the target root.
    InSync,
    /// Request records newer than this point.
    From(SeqHash),
    /// Local inconsistency; cannot start.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpocket_types::LedgerRecord;
    use hotpocket_vfs::{DirFs, RW_SESSION_NAME};

    struct Node {
        _dir: tempfile::TempDir,
        mount: Arc<DirFs>,
        ledger: Arc<LedgerStore>,
    }

    fn node() -> Node {
        let dir = tempfile::tempdir().unwrap();
        let mount = Arc::new(DirFs::open(0, dir.path().join("fs")).unwrap());
        let ledger = Arc::new(LedgerStore::open(dir.path().join("ledger")).unwrap());
        Node {
            _dir: dir,
            mount,
            ledger,
        }
    }

    /// Commit one round on a node: mutate state, promote, stamp the log
    /// index, append the ledger record.
    fn commit_round(node: &Node, seq: u64, content: &[u8]) {
        node.mount.acquire_rw().unwrap();
        std::fs::write(
            node.mount.physical_path(RW_SESSION_NAME, "/state/v"),
            content,
        )
        .unwrap();
        node.mount.promote_rw().unwrap();
        node.mount.release_rw().unwrap();
        node.mount.update_log_index(seq).unwrap();

        let (state, patch) = node.mount.state_and_patch_hashes().unwrap();
        let prev = node.ledger.last_record();
        let record = LedgerRecord {
            seq_no: seq,
            timestamp: 1_000 + seq,
            ledger_hash: Hash::ZERO,
            prev_ledger_hash: prev.ledger_hash,
            data_hash: Hash::ZERO,
            state_hash: state,
            config_hash: patch,
            nonce: Hash::ZERO,
            user_hash: Hash::ZERO,
            input_hash: Hash::ZERO,
            output_hash: Hash::ZERO,
        }
        .seal();
        node.ledger.append(&record, &[], &[], &[]).unwrap();
    }

    fn manager(node: &Node) -> LogSyncManager {
        LogSyncManager::new(
            node.mount.clone(),
            node.ledger.clone(),
            Duration::from_millis(700),
        )
    }

    fn target_of(node: &Node) -> SeqHash {
        SeqHash::new(
            node.ledger.lcl().seq_no,
            node.mount.root_hash().unwrap(),
        )
    }

    #[test]
    fn fresh_node_pulls_full_log() {
        let source = node();
        for seq in 1..=3 {
            commit_round(&source, seq, &seq.to_le_bytes());
        }
        let fresh = node();

        let server = manager(&source);
        let mut client = manager(&fresh);

        assert!(client.set_target(target_of(&source)).is_none());
        let outs = client.tick(Duration::from_millis(1000));
        let request = match &outs[..] {
            [LogSyncOutcome::Request(r)] => *r,
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(request.min_record_id.seq_no, 0);

        let response = server.serve(&request).unwrap();
        let outs = client.on_response(response);
        assert!(matches!(outs.as_slice(), [LogSyncOutcome::Completed { .. }]));
        assert_eq!(
            fresh.mount.root_hash().unwrap(),
            source.mount.root_hash().unwrap()
        );
        assert_eq!(fresh.mount.last_log_seq_no().unwrap(), 3);
    }

    #[test]
    fn forked_node_finds_joining_point_and_recovers() {
        // Shared history up to seq 2.
        let source = node();
        let forked = node();
        for seq in 1..=2 {
            commit_round(&source, seq, &seq.to_le_bytes());
            commit_round(&forked, seq, &seq.to_le_bytes());
        }
        // Histories diverge at 3; the forked node's ledger then adopts
        // the source's records (consensus moved on without it), leaving
        // its log index stale and disagreeing.
        commit_round(&source, 3, b"canonical");

        // Fork: node logs a different round 3, then fixes its ledger to
        // the canonical record (as ledger sync would).
        forked.mount.acquire_rw().unwrap();
        std::fs::write(
            forked.mount.physical_path(RW_SESSION_NAME, "/state/v"),
            b"divergent",
        )
        .unwrap();
        forked.mount.promote_rw().unwrap();
        forked.mount.release_rw().unwrap();
        forked.mount.update_log_index(3).unwrap();

        let canonical = source.ledger.get_by_seq_no(3).unwrap().unwrap();
        forked.ledger.append(&canonical, &[], &[], &[]).unwrap();

        let server = manager(&source);
        let mut client = manager(&forked);

        assert!(client.set_target(target_of(&source)).is_none());
        // The walk-back lands on seq 2, where ledger and log agree, and
        // truncates the divergent record.
        assert_eq!(client.min_record.seq_no, 2);
        assert_eq!(forked.mount.last_log_seq_no().unwrap(), 2);

        let outs = client.tick(Duration::from_millis(1000));
        let request = match &outs[..] {
            [LogSyncOutcome::Request(r)] => *r,
            other => panic!("expected request, got {other:?}"),
        };
        let response = server.serve(&request).unwrap();
        let outs = client.on_response(response);
        assert!(matches!(outs.as_slice(), [LogSyncOutcome::Completed { .. }]));
        assert_eq!(
            forked.mount.root_hash().unwrap(),
            source.mount.root_hash().unwrap()
        );
    }

    #[test]
    fn server_refuses_unknown_joining_point() {
        let source = node();
        commit_round(&source, 1, b"one");
        let server = manager(&source);

        let bogus = HpfsLogRequest {
            target_seq_no: 1,
            min_record_id: SeqHash::new(1, Hash::digest(b"not our root")),
        };
        assert!(server.serve(&bogus).is_none());

        // Genesis is always servable.
        let genesis_req = HpfsLogRequest {
            target_seq_no: 1,
            min_record_id: server.genesis,
        };
        assert!(server.serve(&genesis_req).is_some());
    }

    #[test]
    fn in_sync_node_completes_immediately() {
        let source = node();
        commit_round(&source, 1, b"one");
        let mut client = manager(&source);
        let outcome = client.set_target(target_of(&source));
        assert!(matches!(outcome, Some(LogSyncOutcome::Completed { .. })));
        assert!(!client.is_syncing());
    }

    #[test]
    fn abandon_after_threshold() {
        let source = node();
        commit_round(&source, 1, b"one");
        let fresh = node();
        let mut client = manager(&fresh);
        client.set_target(target_of(&source));

        let mut now = Duration::ZERO;
        for _ in 0..ABANDON_THRESHOLD {
            now += Duration::from_millis(1000);
            assert!(matches!(
                client.tick(now).as_slice(),
                [LogSyncOutcome::Request(_)]
            ));
        }
        now += Duration::from_millis(1000);
        assert!(matches!(
            client.tick(now).as_slice(),
            [LogSyncOutcome::Abandoned]
        ));
    }
}
