//! Block-level state sync.

use crate::ABANDON_THRESHOLD;
use hotpocket_messages::{
    FsEntryResponseType, FsHashEntry, HpfsRequest, HpfsRequestHint, HpfsResponse,
    HpfsResponseContent,
};
use hotpocket_types::{FieldHasher, Hash};
use hotpocket_vfs::{VfsMount, BLOCK_SIZE, PATCH_FILE_PATH, RW_SESSION_NAME, STATE_DIR_PATH};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// What the node is converging toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTarget {
    /// Target state-tree root.
    pub state_hash: Hash,
    /// Target patch-file hash.
    pub patch_hash: Hash,
}

/// What a tick or response produced.
#[derive(Debug)]
pub enum StateSyncOutcome {
    /// Send this request to a random UNL peer.
    Request(HpfsRequest),
    /// The local tree now matches the target.
    Completed(SyncTarget),
    /// Too many unanswered resubmissions; attempt dropped.
    Abandoned,
}

/// One outstanding request.
#[derive(Debug)]
struct PendingRequest {
    request: HpfsRequest,
    requested_on: Option<Duration>,
    submissions: u32,
}

impl PendingRequest {
    fn new(request: HpfsRequest) -> Self {
        Self {
            request,
            requested_on: None,
            submissions: 0,
        }
    }
}

/// Key addressing one pending request: vpath plus block id (block
/// requests for the same file coexist).
type RequestKey = (String, Option<u32>);

/// Recursive-descent state synchronizer.
///
/// The runner drives it: `set_target` starts an attempt, `tick`
/// produces (re)submissions, `on_response` applies verified payloads
/// into the RW session and queues the next level of requests. The
/// manager also serves other peers' requests from the canonical tree.
pub struct StateSyncManager {
    mount: Arc<dyn VfsMount>,
    resubmit_timeout: Duration,
    target: Option<SyncTarget>,
    pending: HashMap<RequestKey, PendingRequest>,
    /// RW held for the duration of the attempt.
    rw_held: bool,
}

impl StateSyncManager {
    /// Create a manager for one mount.
    pub fn new(mount: Arc<dyn VfsMount>, resubmit_timeout: Duration) -> Self {
        Self {
            mount,
            resubmit_timeout,
            target: None,
            pending: HashMap::new(),
            rw_held: false,
        }
    }

    /// Whether an attempt is in flight.
    pub fn is_syncing(&self) -> bool {
        self.target.is_some()
    }

    /// Begin converging toward `target`. A matching in-flight attempt
    /// is left alone.
    pub fn set_target(&mut self, target: SyncTarget) -> Result<(), hotpocket_vfs::VfsError> {
        if self.target == Some(target) {
            return Ok(());
        }
        info!(state = ?target.state_hash, patch = ?target.patch_hash, "State sync starting");

        if !self.rw_held {
            self.mount.acquire_rw()?;
            self.rw_held = true;
        }
        self.target = Some(target);
        self.pending.clear();

        // Root comparisons decide what to request at all.
        if self.local_hash(STATE_DIR_PATH) != Some(target.state_hash) {
            self.queue_dir_request(STATE_DIR_PATH, target.state_hash);
        }
        if self.local_hash(PATCH_FILE_PATH) != Some(target.patch_hash) {
            self.queue_file_request(PATCH_FILE_PATH, target.patch_hash);
        }
        Ok(())
    }

    /// Drive submissions and timeouts.
    pub fn tick(&mut self, now: Duration) -> Vec<StateSyncOutcome> {
        if self.target.is_none() {
            return vec![];
        }
        if self.pending.is_empty() {
            return self.try_finish();
        }

        let mut out = Vec::new();
        let mut abandon = false;
        for pending in self.pending.values_mut() {
            let due = match pending.requested_on {
                None => true,
                Some(at) => now.saturating_sub(at) > self.resubmit_timeout,
            };
            if !due {
                continue;
            }
            if pending.submissions >= ABANDON_THRESHOLD {
                abandon = true;
                break;
            }
            pending.requested_on = Some(now);
            pending.submissions += 1;
            trace!(
                vpath = %pending.request.vpath,
                submissions = pending.submissions,
                "Submitting sync request"
            );
            out.push(StateSyncOutcome::Request(pending.request.clone()));
        }

        if abandon {
            warn!("Resubmission threshold exceeded, abandoning state sync");
            self.reset();
            return vec![StateSyncOutcome::Abandoned];
        }
        out
    }

    /// Apply a peer's response.
    pub fn on_response(&mut self, response: HpfsResponse) -> Vec<StateSyncOutcome> {
        if self.target.is_none() {
            return vec![];
        }

        let key: RequestKey = match &response.content {
            HpfsResponseContent::Block { block_id, .. } => {
                (response.vpath.clone(), Some(*block_id))
            }
            _ => (response.vpath.clone(), None),
        };
        let Some(pending) = self.pending.get(&key) else {
            trace!(vpath = %response.vpath, "Unsolicited sync response ignored");
            return vec![];
        };
        let expected = pending.request.expected_hash;

        let applied = match &response.content {
            HpfsResponseContent::FsEntries { entries, .. } => {
                self.apply_dir_response(&response.vpath, entries, expected)
            }
            HpfsResponseContent::FileHashMap {
                file_length,
                hashes,
                ..
            } => self.apply_hashmap_response(&response.vpath, *file_length, hashes, expected),
            HpfsResponseContent::Block { block_id, data } => {
                self.apply_block_response(&response.vpath, *block_id, data, expected)
            }
        };

        match applied {
            Ok(true) => {
                self.pending.remove(&key);
                if self.pending.is_empty() {
                    return self.try_finish();
                }
                vec![]
            }
            Ok(false) => {
                // Hash did not verify: the peer is ignored for this
                // request; the resubmission timer will pick another.
                debug!(vpath = %response.vpath, "Sync response failed hash verification");
                vec![]
            }
            Err(e) => {
                warn!(vpath = %response.vpath, error = %e, "Applying sync response failed");
                vec![]
            }
        }
    }

    /// Serve a peer's request from the canonical tree. `None` when we
    /// cannot answer (no such path or hash moved on).
    pub fn serve(&self, request: &HpfsRequest) -> Option<HpfsResponse> {
        let session = "ro_serve";
        self.mount.start_ro(session, true).ok()?;
        let response = self.serve_inner(request, session);
        let _ = self.mount.stop_ro(session);
        response
    }

    fn serve_inner(&self, request: &HpfsRequest, session: &str) -> Option<HpfsResponse> {
        let content = if !request.is_file {
            let children = self
                .mount
                .get_dir_children_hashes(session, &request.vpath)
                .ok()?;
            let hints: HashMap<&str, &FsHashEntry> = match &request.hint {
                HpfsRequestHint::FsEntries(entries) => {
                    entries.iter().map(|e| (e.name.as_str(), e)).collect()
                }
                _ => HashMap::new(),
            };

            let mut entries: Vec<FsHashEntry> = children
                .iter()
                .map(|child| {
                    let response_type = match hints.get(child.name.as_str()) {
                        Some(hint) if hint.hash == child.hash => FsEntryResponseType::Matched,
                        _ => FsEntryResponseType::Mismatched,
                    };
                    FsHashEntry {
                        name: child.name.clone(),
                        is_file: child.is_file,
                        hash: child.hash,
                        response_type,
                    }
                })
                .collect();
            // Hinted entries we no longer have must be deleted on the
            // requester side.
            for (name, hint) in &hints {
                if !children.iter().any(|c| c.name == *name) {
                    entries.push(FsHashEntry {
                        name: (*name).to_string(),
                        is_file: hint.is_file,
                        hash: Hash::ZERO,
                        response_type: FsEntryResponseType::NotAvailable,
                    });
                }
            }
            HpfsResponseContent::FsEntries {
                dir_mode: 0o755,
                entries,
            }
        } else if let Some(block_id) = request.block_id {
            let path = self.mount.physical_path(session, &request.vpath);
            let bytes = std::fs::read(&path).ok()?;
            let start = block_id as usize * BLOCK_SIZE;
            if start > bytes.len() {
                return None;
            }
            let end = (start + BLOCK_SIZE).min(bytes.len());
            HpfsResponseContent::Block {
                block_id,
                data: bytes[start..end].to_vec(),
            }
        } else {
            let hashes = self
                .mount
                .get_file_block_hashes(session, &request.vpath)
                .ok()?;
            let path = self.mount.physical_path(session, &request.vpath);
            let file_length = std::fs::metadata(&path).ok()?.len();
            HpfsResponseContent::FileHashMap {
                file_length,
                file_mode: 0o644,
                hashes,
                responded_block_ids: vec![],
            }
        };

        Some(HpfsResponse {
            mount_id: request.mount_id,
            vpath: request.vpath.clone(),
            expected_hash: request.expected_hash,
            content,
        })
    }

    // ── application ──────────────────────────────────────────────────────

    fn apply_dir_response(
        &mut self,
        vpath: &str,
        entries: &[FsHashEntry],
        expected: Hash,
    ) -> Result<bool, std::io::Error> {
        // Verify: folding the advertised children must reproduce the
        // hash the parent promised for this directory.
        let mut folded = Hash::ZERO;
        for entry in entries {
            if entry.response_type == FsEntryResponseType::NotAvailable {
                continue;
            }
            let mut hasher = FieldHasher::new();
            hasher.add_bytes(entry.name.as_bytes()).add_hash(&entry.hash);
            folded.xor(&hasher.finish());
        }
        if folded != expected {
            return Ok(false);
        }

        let dir = self.mount.physical_path(RW_SESSION_NAME, vpath);
        std::fs::create_dir_all(&dir)?;

        for entry in entries {
            let child_vpath = join_vpath(vpath, &entry.name);
            match entry.response_type {
                FsEntryResponseType::Matched => {}
                FsEntryResponseType::NotAvailable => {
                    let path = dir.join(&entry.name);
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)?;
                    } else if path.exists() {
                        std::fs::remove_file(&path)?;
                    }
                }
                FsEntryResponseType::Mismatched => {
                    if self.local_rw_hash(&child_vpath) == Some(entry.hash) {
                        continue;
                    }
                    if entry.is_file {
                        self.queue_file_request(&child_vpath, entry.hash);
                    } else {
                        std::fs::create_dir_all(dir.join(&entry.name))?;
                        self.queue_dir_request(&child_vpath, entry.hash);
                    }
                }
            }
        }
        Ok(true)
    }

    fn apply_hashmap_response(
        &mut self,
        vpath: &str,
        file_length: u64,
        hashes: &[Hash],
        expected: Hash,
    ) -> Result<bool, std::io::Error> {
        let mut folded = Hash::ZERO;
        for (index, hash) in hashes.iter().enumerate() {
            let mut hasher = FieldHasher::new();
            hasher.add_u64(index as u64).add_hash(hash);
            folded.xor(&hasher.finish());
        }
        if folded != expected {
            return Ok(false);
        }

        let path = self.mount.physical_path(RW_SESSION_NAME, vpath);
        let local_blocks = self
            .mount
            .get_file_block_hashes(RW_SESSION_NAME, vpath)
            .unwrap_or_default();

        // Size the file to the target length up front so block writes
        // land at their final offsets.
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(file_length)?;

        for (index, hash) in hashes.iter().enumerate() {
            if local_blocks.get(index) == Some(hash) {
                continue;
            }
            self.queue_block_request(vpath, index as u32, *hash);
        }
        Ok(true)
    }

    fn apply_block_response(
        &mut self,
        vpath: &str,
        block_id: u32,
        data: &[u8],
        expected: Hash,
    ) -> Result<bool, std::io::Error> {
        if Hash::digest(data) != expected {
            return Ok(false);
        }
        let path = self.mount.physical_path(RW_SESSION_NAME, vpath);
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(block_id as u64 * BLOCK_SIZE as u64))?;
        file.write_all(data)?;
        Ok(true)
    }

    /// Nothing pending: check the roots and finish or re-descend.
    fn try_finish(&mut self) -> Vec<StateSyncOutcome> {
        let Some(target) = self.target else {
            return vec![];
        };
        let state_ok = self.local_rw_hash(STATE_DIR_PATH) == Some(target.state_hash);
        let patch_ok = self.local_rw_hash(PATCH_FILE_PATH) == Some(target.patch_hash);

        if state_ok && patch_ok {
            info!(state = ?target.state_hash, "State sync target achieved");
            if let Err(e) = self.mount.promote_rw() {
                warn!(error = %e, "Promoting synced state failed");
            }
            self.mount.set_parent_hash(STATE_DIR_PATH, target.state_hash);
            self.mount.set_parent_hash(PATCH_FILE_PATH, target.patch_hash);
            self.reset();
            return vec![StateSyncOutcome::Completed(target)];
        }

        // A verified-but-incomplete level: descend again from the top.
        debug!("Roots still differ after applying level, re-descending");
        if !state_ok {
            self.queue_dir_request(STATE_DIR_PATH, target.state_hash);
        }
        if !patch_ok {
            self.queue_file_request(PATCH_FILE_PATH, target.patch_hash);
        }
        vec![]
    }

    fn reset(&mut self) {
        self.target = None;
        self.pending.clear();
        if self.rw_held {
            if let Err(e) = self.mount.release_rw() {
                warn!(error = %e, "Releasing RW after sync failed");
            }
            self.rw_held = false;
        }
    }

    // ── request queuing ──────────────────────────────────────────────────

    fn queue_dir_request(&mut self, vpath: &str, expected_hash: Hash) {
        let hints = self
            .mount
            .get_dir_children_hashes(RW_SESSION_NAME, vpath)
            .map(|children| {
                children
                    .into_iter()
                    .map(|c| FsHashEntry {
                        name: c.name,
                        is_file: c.is_file,
                        hash: c.hash,
                        response_type: FsEntryResponseType::Matched,
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.pending.insert(
            (vpath.to_string(), None),
            PendingRequest::new(HpfsRequest {
                mount_id: self.mount.mount_id(),
                vpath: vpath.to_string(),
                is_file: false,
                block_id: None,
                expected_hash,
                hint: HpfsRequestHint::FsEntries(hints),
            }),
        );
    }

    fn queue_file_request(&mut self, vpath: &str, expected_hash: Hash) {
        let hint = self
            .mount
            .get_file_block_hashes(RW_SESSION_NAME, vpath)
            .map(HpfsRequestHint::FileHashMap)
            .unwrap_or(HpfsRequestHint::None);

        self.pending.insert(
            (vpath.to_string(), None),
            PendingRequest::new(HpfsRequest {
                mount_id: self.mount.mount_id(),
                vpath: vpath.to_string(),
                is_file: true,
                block_id: None,
                expected_hash,
                hint,
            }),
        );
    }

    fn queue_block_request(&mut self, vpath: &str, block_id: u32, expected_hash: Hash) {
        self.pending.insert(
            (vpath.to_string(), Some(block_id)),
            PendingRequest::new(HpfsRequest {
                mount_id: self.mount.mount_id(),
                vpath: vpath.to_string(),
                is_file: true,
                block_id: Some(block_id),
                expected_hash,
                hint: HpfsRequestHint::None,
            }),
        );
    }

    fn local_hash(&self, vpath: &str) -> Option<Hash> {
        self.mount.get_hash("ro", vpath).ok()
    }

    fn local_rw_hash(&self, vpath: &str) -> Option<Hash> {
        self.mount.get_hash(RW_SESSION_NAME, vpath).ok()
    }
}

fn join_vpath(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpocket_vfs::DirFs;

    fn mount_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, Arc<DirFs>) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(DirFs::open(0, dir.path()).unwrap());
        if !files.is_empty() {
            fs.acquire_rw().unwrap();
            for (vpath, bytes) in files {
                let path = fs.physical_path(RW_SESSION_NAME, vpath);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, bytes).unwrap();
            }
            fs.promote_rw().unwrap();
            fs.release_rw().unwrap();
        }
        (dir, fs)
    }

    fn target_of(fs: &DirFs) -> SyncTarget {
        let (state, patch) = fs.state_and_patch_hashes().unwrap();
        SyncTarget {
            state_hash: state,
            patch_hash: patch,
        }
    }

    /// Run requests between a lagging manager and a serving manager
    /// until completion or `max_rounds`.
    fn converge(
        lagging: &mut StateSyncManager,
        serving: &StateSyncManager,
        max_rounds: usize,
    ) -> bool {
        let mut now = Duration::from_millis(0);
        for _ in 0..max_rounds {
            now += Duration::from_millis(1000);
            let outs = lagging.tick(now);
            let mut requests = Vec::new();
            for out in outs {
                match out {
                    StateSyncOutcome::Request(r) => requests.push(r),
                    StateSyncOutcome::Completed(_) => return true,
                    StateSyncOutcome::Abandoned => return false,
                }
            }
            for request in requests {
                if let Some(response) = serving.serve(&request) {
                    for out in lagging.on_response(response) {
                        if matches!(out, StateSyncOutcome::Completed(_)) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    #[test]
    fn empty_node_converges_to_peer_state() {
        let (_sd, source) = mount_with(&[
            ("/state/a.txt", b"alpha"),
            ("/state/sub/b.txt", b"beta"),
            ("/patch.cfg", b"{\"unl\":[]}"),
        ]);
        let (_td, fresh) = mount_with(&[]);

        let server = StateSyncManager::new(source.clone(), Duration::from_millis(700));
        let mut client = StateSyncManager::new(fresh.clone(), Duration::from_millis(700));

        client.set_target(target_of(&source)).unwrap();
        assert!(converge(&mut client, &server, 16));
        assert_eq!(fresh.root_hash().unwrap(), source.root_hash().unwrap());
        assert_eq!(
            std::fs::read(fresh.physical_path("ro", "/state/sub/b.txt")).unwrap(),
            b"beta"
        );
    }

    #[test]
    fn diverged_node_deletes_extras_and_converges() {
        let (_sd, source) = mount_with(&[("/state/keep.txt", b"keep")]);
        let (_td, forked) = mount_with(&[
            ("/state/keep.txt", b"stale content"),
            ("/state/extra.txt", b"should disappear"),
        ]);

        let server = StateSyncManager::new(source.clone(), Duration::from_millis(700));
        let mut client = StateSyncManager::new(forked.clone(), Duration::from_millis(700));

        client.set_target(target_of(&source)).unwrap();
        assert!(converge(&mut client, &server, 16));
        assert_eq!(forked.root_hash().unwrap(), source.root_hash().unwrap());
        assert!(!forked.physical_path("ro", "/state/extra.txt").exists());
    }

    #[test]
    fn already_in_sync_completes_without_requests() {
        let (_sd, source) = mount_with(&[("/state/a", b"x")]);
        let (_td, twin) = mount_with(&[("/state/a", b"x")]);

        let mut client = StateSyncManager::new(twin, Duration::from_millis(700));
        client.set_target(target_of(&source)).unwrap();

        let outs = client.tick(Duration::from_millis(1000));
        assert!(matches!(outs.as_slice(), [StateSyncOutcome::Completed(_)]));
    }

    #[test]
    fn unanswered_requests_abandon_after_threshold() {
        let (_sd, source) = mount_with(&[("/state/a", b"x")]);
        let (_td, fresh) = mount_with(&[]);

        let mut client = StateSyncManager::new(fresh, Duration::from_millis(700));
        client.set_target(target_of(&source)).unwrap();

        let mut now = Duration::ZERO;
        for _ in 0..ABANDON_THRESHOLD {
            now += Duration::from_millis(1000);
            let outs = client.tick(now);
            assert!(outs
                .iter()
                .all(|o| matches!(o, StateSyncOutcome::Request(_))));
        }
        now += Duration::from_millis(1000);
        let outs = client.tick(now);
        assert!(matches!(outs.as_slice(), [StateSyncOutcome::Abandoned]));
        assert!(!client.is_syncing());
    }

    #[test]
    fn tampered_response_is_rejected() {
        let (_sd, source) = mount_with(&[("/state/a", b"x")]);
        let (_td, fresh) = mount_with(&[]);

        let server = StateSyncManager::new(source.clone(), Duration::from_millis(700));
        let mut client = StateSyncManager::new(fresh, Duration::from_millis(700));
        client.set_target(target_of(&source)).unwrap();

        let outs = client.tick(Duration::from_millis(1000));
        let request = outs
            .iter()
            .find_map(|o| match o {
                StateSyncOutcome::Request(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();

        let mut response = server.serve(&request).unwrap();
        if let HpfsResponseContent::FsEntries { entries, .. } = &mut response.content {
            if let Some(first) = entries.first_mut() {
                first.hash = Hash::digest(b"forged");
            }
        }
        // A forged child list cannot fold to the expected hash; the
        // request stays pending.
        client.on_response(response);
        assert!(client.is_syncing());
        assert!(!client.pending.is_empty());
    }
}
