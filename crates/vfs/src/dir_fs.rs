//! Directory-backed mount implementation.
//!
//! Stands in for the external vfs daemon: canonical state lives under
//! `seed/`, the RW session is a working copy under `rw/`, and the
//! op-log is a frame file whose payloads carry state snapshots so a
//! truncate or a peer append can rebuild the tree at any logged point.

use crate::log::{decode_frames, encode_frames, LogFrame};
use crate::mount::{ChildHashNode, VfsError, VfsMount};
use crate::{BLOCK_SIZE, RW_SESSION_NAME};
use hotpocket_types::{vfs_root_hash, FieldHasher, Hash};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// A mount rooted in a local directory.
pub struct DirFs {
    mount_id: u32,
    seed_dir: PathBuf,
    rw_dir: PathBuf,
    log_path: PathBuf,

    /// RW consumers; the working copy materializes at 0→1 and is
    /// discarded un-promoted at 1→0.
    rw_consumers: Mutex<u32>,
    /// Open read-only snapshot names.
    ro_sessions: Mutex<HashSet<String>>,
    /// Cached subtree hashes keyed by vpath. Many readers, single
    /// writer on promotion or sync apply.
    parent_hashes: RwLock<HashMap<String, Hash>>,
    /// Serializes log file rewrites.
    log_lock: Mutex<()>,
}

impl DirFs {
    /// Open (or scaffold) a mount under `fs_dir`.
    pub fn open(mount_id: u32, fs_dir: impl AsRef<Path>) -> Result<Self, VfsError> {
        let fs_dir = fs_dir.as_ref().to_path_buf();
        let seed_dir = fs_dir.join("seed");
        let rw_dir = fs_dir.join("rw");
        let log_dir = fs_dir.join("log");

        let state_seed = seed_dir.join("state");
        fs::create_dir_all(&state_seed)
            .map_err(|e| VfsError::io(state_seed.display().to_string(), e))?;
        fs::create_dir_all(&log_dir)
            .map_err(|e| VfsError::io(log_dir.display().to_string(), e))?;
        let patch_seed = seed_dir.join("patch.cfg");
        if !patch_seed.exists() {
            fs::write(&patch_seed, b"")
                .map_err(|e| VfsError::io(patch_seed.display().to_string(), e))?;
        }

        Ok(Self {
            mount_id,
            seed_dir,
            rw_dir,
            log_path: log_dir.join("frames.bin"),
            rw_consumers: Mutex::new(0),
            ro_sessions: Mutex::new(HashSet::new()),
            parent_hashes: RwLock::new(HashMap::new()),
            log_lock: Mutex::new(()),
        })
    }

    /// Root of a session's physical tree.
    fn session_dir(&self, session: &str) -> &Path {
        if session == RW_SESSION_NAME {
            &self.rw_dir
        } else {
            &self.seed_dir
        }
    }

    fn resolve(&self, session: &str, vpath: &str) -> PathBuf {
        let trimmed = vpath.trim_start_matches('/');
        self.session_dir(session).join(trimmed)
    }

    /// Canonical root: `H(patch_hash, state_hash)`.
    pub fn root_hash(&self) -> Result<Hash, VfsError> {
        let state = hash_path(&self.seed_dir.join("state"))?;
        let patch = hash_path(&self.seed_dir.join("patch.cfg"))?;
        Ok(vfs_root_hash(&patch, &state))
    }

    /// Canonical state and patch hashes, in one read.
    pub fn state_and_patch_hashes(&self) -> Result<(Hash, Hash), VfsError> {
        let state = hash_path(&self.seed_dir.join("state"))?;
        let patch = hash_path(&self.seed_dir.join("patch.cfg"))?;
        Ok((state, patch))
    }

    // ── log plumbing ─────────────────────────────────────────────────────

    fn load_frames(&self) -> Result<Vec<LogFrame>, VfsError> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.log_path)
            .map_err(|e| VfsError::io(self.log_path.display().to_string(), e))?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        decode_frames(&bytes).map_err(|e| VfsError::LogCorrupt(e.to_string()))
    }

    fn store_frames(&self, frames: &[LogFrame]) -> Result<(), VfsError> {
        fs::write(&self.log_path, encode_frames(frames))
            .map_err(|e| VfsError::io(self.log_path.display().to_string(), e))
    }

    /// Reset the canonical tree to a frame's snapshot (or to the empty
    /// genesis tree when `frame` is `None`).
    fn restore_snapshot(&self, frame: Option<&LogFrame>) -> Result<(), VfsError> {
        fs::remove_dir_all(&self.seed_dir)
            .map_err(|e| VfsError::io(self.seed_dir.display().to_string(), e))?;
        fs::create_dir_all(self.seed_dir.join("state"))
            .map_err(|e| VfsError::io(self.seed_dir.display().to_string(), e))?;
        fs::write(self.seed_dir.join("patch.cfg"), b"")
            .map_err(|e| VfsError::io("patch.cfg".to_string(), e))?;

        if let Some(frame) = frame {
            let files: Vec<(String, Vec<u8>)> = bincode::deserialize(&frame.data)
                .map_err(|e| VfsError::LogCorrupt(e.to_string()))?;
            for (vpath, bytes) in files {
                let path = self.resolve("seed", &vpath);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| VfsError::io(parent.display().to_string(), e))?;
                }
                fs::write(&path, bytes)
                    .map_err(|e| VfsError::io(path.display().to_string(), e))?;
            }
        }
        self.parent_hashes.write().clear();
        Ok(())
    }

    fn snapshot_tree(&self) -> Result<Vec<u8>, VfsError> {
        let mut files = Vec::new();
        collect_files(&self.seed_dir, &self.seed_dir, &mut files)?;
        Ok(bincode::serialize(&files).expect("snapshot serialize"))
    }
}

impl VfsMount for DirFs {
    fn mount_id(&self) -> u32 {
        self.mount_id
    }

    fn acquire_rw(&self) -> Result<(), VfsError> {
        let mut consumers = self.rw_consumers.lock();
        if *consumers == 0 {
            if self.rw_dir.exists() {
                fs::remove_dir_all(&self.rw_dir)
                    .map_err(|e| VfsError::io(self.rw_dir.display().to_string(), e))?;
            }
            copy_dir(&self.seed_dir, &self.rw_dir)?;
            trace!(mount = self.mount_id, "RW session materialized");
        }
        *consumers += 1;
        Ok(())
    }

    fn release_rw(&self) -> Result<(), VfsError> {
        let mut consumers = self.rw_consumers.lock();
        if *consumers == 0 {
            return Err(VfsError::RwNotHeld);
        }
        *consumers -= 1;
        if *consumers == 0 && self.rw_dir.exists() {
            fs::remove_dir_all(&self.rw_dir)
                .map_err(|e| VfsError::io(self.rw_dir.display().to_string(), e))?;
            trace!(mount = self.mount_id, "RW session dropped");
        }
        Ok(())
    }

    fn promote_rw(&self) -> Result<(), VfsError> {
        let consumers = self.rw_consumers.lock();
        if *consumers == 0 {
            return Err(VfsError::RwNotHeld);
        }
        fs::remove_dir_all(&self.seed_dir)
            .map_err(|e| VfsError::io(self.seed_dir.display().to_string(), e))?;
        copy_dir(&self.rw_dir, &self.seed_dir)?;
        self.parent_hashes.write().clear();
        debug!(mount = self.mount_id, "RW session promoted");
        Ok(())
    }

    fn revert_rw(&self) -> Result<(), VfsError> {
        let consumers = self.rw_consumers.lock();
        if *consumers == 0 {
            // Nothing held, nothing to revert.
            return Ok(());
        }
        fs::remove_dir_all(&self.rw_dir)
            .map_err(|e| VfsError::io(self.rw_dir.display().to_string(), e))?;
        copy_dir(&self.seed_dir, &self.rw_dir)?;
        debug!(mount = self.mount_id, "RW session reverted");
        Ok(())
    }

    fn start_ro(&self, name: &str, _with_hashmap: bool) -> Result<(), VfsError> {
        self.ro_sessions.lock().insert(name.to_string());
        Ok(())
    }

    fn stop_ro(&self, name: &str) -> Result<(), VfsError> {
        if !self.ro_sessions.lock().remove(name) {
            return Err(VfsError::UnknownSession(name.to_string()));
        }
        Ok(())
    }

    fn get_hash(&self, session: &str, vpath: &str) -> Result<Hash, VfsError> {
        hash_path(&self.resolve(session, vpath))
    }

    fn get_file_block_hashes(&self, session: &str, vpath: &str) -> Result<Vec<Hash>, VfsError> {
        let path = self.resolve(session, vpath);
        let file = fs::File::open(&path)
            .map_err(|_| VfsError::NotFound(vpath.to_string()))?;
        let mut reader = std::io::BufReader::new(file);
        let mut hashes = Vec::new();
        let mut block = vec![0u8; BLOCK_SIZE];
        loop {
            let n = read_block(&mut reader, &mut block)
                .map_err(|e| VfsError::io(path.display().to_string(), e))?;
            if n == 0 {
                break;
            }
            hashes.push(Hash::digest(&block[..n]));
        }
        Ok(hashes)
    }

    fn get_dir_children_hashes(
        &self,
        session: &str,
        vpath: &str,
    ) -> Result<Vec<ChildHashNode>, VfsError> {
        let path = self.resolve(session, vpath);
        let entries = fs::read_dir(&path).map_err(|_| VfsError::NotFound(vpath.to_string()))?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VfsError::io(path.display().to_string(), e))?;
            let child_path = entry.path();
            children.push(ChildHashNode {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_file: child_path.is_file(),
                hash: hash_path(&child_path)?,
            });
        }
        // Deterministic listing regardless of readdir order.
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn physical_path(&self, session: &str, vpath: &str) -> PathBuf {
        self.resolve(session, vpath)
    }

    fn get_parent_hash(&self, vpath: &str) -> Hash {
        self.parent_hashes
            .read()
            .get(vpath)
            .copied()
            .unwrap_or(Hash::ZERO)
    }

    fn set_parent_hash(&self, vpath: &str, hash: Hash) {
        self.parent_hashes.write().insert(vpath.to_string(), hash);
    }

    fn update_log_index(&self, seq_no: u64) -> Result<(), VfsError> {
        let _guard = self.log_lock.lock();
        let mut frames = self.load_frames()?;
        let frame = LogFrame {
            seq_no,
            root_hash: self.root_hash()?,
            data: self.snapshot_tree()?,
        };
        frames.retain(|f| f.seq_no < seq_no);
        frames.push(frame);
        self.store_frames(&frames)
    }

    fn truncate_log(&self, seq_no: u64) -> Result<(), VfsError> {
        let _guard = self.log_lock.lock();
        let mut frames = self.load_frames()?;
        frames.retain(|f| f.seq_no <= seq_no);
        self.store_frames(&frames)?;
        debug!(seq_no, remaining = frames.len(), "Log truncated");
        self.restore_snapshot(frames.last())
    }

    fn read_logs(&self, min_seq: u64, max_seq: u64) -> Result<Vec<u8>, VfsError> {
        let _guard = self.log_lock.lock();
        let frames = self.load_frames()?;
        let run: Vec<LogFrame> = frames
            .into_iter()
            .filter(|f| f.seq_no > min_seq && f.seq_no <= max_seq)
            .collect();
        Ok(encode_frames(&run))
    }

    fn append_logs(&self, bytes: &[u8]) -> Result<(), VfsError> {
        let _guard = self.log_lock.lock();
        let incoming = decode_frames(bytes).map_err(|e| VfsError::LogCorrupt(e.to_string()))?;
        if incoming.is_empty() {
            return Ok(());
        }
        let mut frames = self.load_frames()?;
        let last = frames.last().map(|f| f.seq_no).unwrap_or(0);
        let fresh: Vec<LogFrame> = incoming.into_iter().filter(|f| f.seq_no > last).collect();
        if fresh.is_empty() {
            return Ok(());
        }
        frames.extend(fresh);
        self.store_frames(&frames)?;
        // Replaying the appended records leaves the tree at the last
        // logged root.
        self.restore_snapshot(frames.last())
    }

    fn last_log_seq_no(&self) -> Result<u64, VfsError> {
        let _guard = self.log_lock.lock();
        Ok(self.load_frames()?.last().map(|f| f.seq_no).unwrap_or(0))
    }

    fn log_hash_by_seq_no(&self, seq_no: u64) -> Result<Option<Hash>, VfsError> {
        let _guard = self.log_lock.lock();
        Ok(self
            .load_frames()?
            .iter()
            .find(|f| f.seq_no == seq_no)
            .map(|f| f.root_hash))
    }
}

// ── hashing ──────────────────────────────────────────────────────────────

/// Subtree hash of a physical path.
fn hash_path(path: &Path) -> Result<Hash, VfsError> {
    if path.is_file() {
        hash_file(path)
    } else if path.is_dir() {
        hash_dir(path)
    } else {
        Err(VfsError::NotFound(path.display().to_string()))
    }
}

fn hash_file(path: &Path) -> Result<Hash, VfsError> {
    let file =
        fs::File::open(path).map_err(|e| VfsError::io(path.display().to_string(), e))?;
    let mut reader = std::io::BufReader::new(file);
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut folded = Hash::ZERO;
    let mut index: u64 = 0;
    loop {
        let n = read_block(&mut reader, &mut block)
            .map_err(|e| VfsError::io(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        let block_hash = Hash::digest(&block[..n]);
        let mut hasher = FieldHasher::new();
        hasher.add_u64(index).add_hash(&block_hash);
        folded.xor(&hasher.finish());
        index += 1;
    }
    Ok(folded)
}

fn hash_dir(path: &Path) -> Result<Hash, VfsError> {
    let entries =
        fs::read_dir(path).map_err(|e| VfsError::io(path.display().to_string(), e))?;
    let mut folded = Hash::ZERO;
    for entry in entries {
        let entry = entry.map_err(|e| VfsError::io(path.display().to_string(), e))?;
        let child_hash = hash_path(&entry.path())?;
        let mut hasher = FieldHasher::new();
        hasher
            .add_bytes(entry.file_name().to_string_lossy().as_bytes())
            .add_hash(&child_hash);
        folded.xor(&hasher.finish());
    }
    Ok(folded)
}

/// Read up to a full block, tolerating short reads.
fn read_block(reader: &mut impl Read, block: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        let n = reader.read(&mut block[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), VfsError> {
    fs::create_dir_all(to).map_err(|e| VfsError::io(to.display().to_string(), e))?;
    for entry in fs::read_dir(from).map_err(|e| VfsError::io(from.display().to_string(), e))? {
        let entry = entry.map_err(|e| VfsError::io(from.display().to_string(), e))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst).map_err(|e| VfsError::io(src.display().to_string(), e))?;
        }
    }
    Ok(())
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, Vec<u8>)>,
) -> Result<(), VfsError> {
    for entry in fs::read_dir(dir).map_err(|e| VfsError::io(dir.display().to_string(), e))? {
        let entry = entry.map_err(|e| VfsError::io(dir.display().to_string(), e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("child of root")
                .to_string_lossy()
                .into_owned();
            let bytes =
                fs::read(&path).map_err(|e| VfsError::io(path.display().to_string(), e))?;
            out.push((format!("/{rel}"), bytes));
        }
    }
    Ok(())
}
