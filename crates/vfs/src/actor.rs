//! Actor ownership of a mount.
//!
//! All vfs calls from async code go through one actor that owns the
//! mount connection; callers send a typed request and await a typed
//! reply. This keeps blocking filesystem IPC off the async threads and
//! guarantees no caller holds a lock across a vfs call.

use crate::mount::{ChildHashNode, VfsError, VfsMount};
use hotpocket_types::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Reply<T> = oneshot::Sender<Result<T, VfsError>>;

/// Typed requests the actor serves.
pub enum VfsRequest {
    AcquireRw(Reply<()>),
    ReleaseRw(Reply<()>),
    PromoteRw(Reply<()>),
    RevertRw(Reply<()>),
    StartRo { name: String, with_hashmap: bool, reply: Reply<()> },
    StopRo { name: String, reply: Reply<()> },
    GetHash { session: String, vpath: String, reply: Reply<Hash> },
    GetFileBlockHashes { session: String, vpath: String, reply: Reply<Vec<Hash>> },
    GetDirChildrenHashes { session: String, vpath: String, reply: Reply<Vec<ChildHashNode>> },
    PhysicalPath { session: String, vpath: String, reply: oneshot::Sender<PathBuf> },
    UpdateLogIndex { seq_no: u64, reply: Reply<()> },
    TruncateLog { seq_no: u64, reply: Reply<()> },
    ReadLogs { min_seq: u64, max_seq: u64, reply: Reply<Vec<u8>> },
    AppendLogs { bytes: Vec<u8>, reply: Reply<()> },
    LastLogSeqNo(Reply<u64>),
    LogHashBySeqNo { seq_no: u64, reply: Reply<Option<Hash>> },
}

/// Handle to the vfs actor. Cheap to clone; every clone talks to the
/// same mount.
#[derive(Clone)]
pub struct VfsClient {
    tx: mpsc::Sender<VfsRequest>,
    mount_id: u32,
}

impl VfsClient {
    /// Spawn the actor that owns `mount` and return a handle to it.
    pub fn spawn(mount: Arc<dyn VfsMount>) -> Self {
        let (tx, mut rx) = mpsc::channel::<VfsRequest>(256);
        let mount_id = mount.mount_id();

        // Blocking filesystem work stays on the blocking pool.
        tokio::task::spawn_blocking(move || {
            while let Some(request) = rx.blocking_recv() {
                serve(&*mount, request);
            }
            debug!(mount = mount_id, "vfs actor stopped");
        });

        Self { tx, mount_id }
    }

    /// Mount id used in sync requests.
    pub fn mount_id(&self) -> u32 {
        self.mount_id
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> VfsRequest,
    ) -> Result<T, VfsError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| VfsError::UnknownSession("vfs actor gone".into()))?;
        reply_rx
            .await
            .map_err(|_| VfsError::UnknownSession("vfs actor dropped reply".into()))?
    }

    pub async fn acquire_rw(&self) -> Result<(), VfsError> {
        self.call(VfsRequest::AcquireRw).await
    }

    pub async fn release_rw(&self) -> Result<(), VfsError> {
        self.call(VfsRequest::ReleaseRw).await
    }

    pub async fn promote_rw(&self) -> Result<(), VfsError> {
        self.call(VfsRequest::PromoteRw).await
    }

    pub async fn revert_rw(&self) -> Result<(), VfsError> {
        self.call(VfsRequest::RevertRw).await
    }

    pub async fn start_ro(&self, name: &str, with_hashmap: bool) -> Result<(), VfsError> {
        let name = name.to_string();
        self.call(move |reply| VfsRequest::StartRo { name, with_hashmap, reply })
            .await
    }

    pub async fn stop_ro(&self, name: &str) -> Result<(), VfsError> {
        let name = name.to_string();
        self.call(move |reply| VfsRequest::StopRo { name, reply }).await
    }

    pub async fn get_hash(&self, session: &str, vpath: &str) -> Result<Hash, VfsError> {
        let (session, vpath) = (session.to_string(), vpath.to_string());
        self.call(move |reply| VfsRequest::GetHash { session, vpath, reply })
            .await
    }

    pub async fn get_file_block_hashes(
        &self,
        session: &str,
        vpath: &str,
    ) -> Result<Vec<Hash>, VfsError> {
        let (session, vpath) = (session.to_string(), vpath.to_string());
        self.call(move |reply| VfsRequest::GetFileBlockHashes { session, vpath, reply })
            .await
    }

    pub async fn get_dir_children_hashes(
        &self,
        session: &str,
        vpath: &str,
    ) -> Result<Vec<ChildHashNode>, VfsError> {
        let (session, vpath) = (session.to_string(), vpath.to_string());
        self.call(move |reply| VfsRequest::GetDirChildrenHashes { session, vpath, reply })
            .await
    }

    pub async fn physical_path(&self, session: &str, vpath: &str) -> Result<PathBuf, VfsError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(VfsRequest::PhysicalPath {
                session: session.to_string(),
                vpath: vpath.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| VfsError::UnknownSession("vfs actor gone".into()))?;
        reply_rx
            .await
            .map_err(|_| VfsError::UnknownSession("vfs actor dropped reply".into()))
    }

    pub async fn update_log_index(&self, seq_no: u64) -> Result<(), VfsError> {
        self.call(move |reply| VfsRequest::UpdateLogIndex { seq_no, reply })
            .await
    }

    pub async fn truncate_log(&self, seq_no: u64) -> Result<(), VfsError> {
        self.call(move |reply| VfsRequest::TruncateLog { seq_no, reply })
            .await
    }

    pub async fn read_logs(&self, min_seq: u64, max_seq: u64) -> Result<Vec<u8>, VfsError> {
        self.call(move |reply| VfsRequest::ReadLogs { min_seq, max_seq, reply })
            .await
    }

    pub async fn append_logs(&self, bytes: Vec<u8>) -> Result<(), VfsError> {
        self.call(move |reply| VfsRequest::AppendLogs { bytes, reply })
            .await
    }

    pub async fn last_log_seq_no(&self) -> Result<u64, VfsError> {
        self.call(VfsRequest::LastLogSeqNo).await
    }

    pub async fn log_hash_by_seq_no(&self, seq_no: u64) -> Result<Option<Hash>, VfsError> {
        self.call(move |reply| VfsRequest::LogHashBySeqNo { seq_no, reply })
            .await
    }
}

fn serve(mount: &dyn VfsMount, request: VfsRequest) {
    match request {
        VfsRequest::AcquireRw(reply) => {
            let _ = reply.send(mount.acquire_rw());
        }
        VfsRequest::ReleaseRw(reply) => {
            let _ = reply.send(mount.release_rw());
        }
        VfsRequest::PromoteRw(reply) => {
            let _ = reply.send(mount.promote_rw());
        }
        VfsRequest::RevertRw(reply) => {
            let _ = reply.send(mount.revert_rw());
        }
        VfsRequest::StartRo { name, with_hashmap, reply } => {
            let _ = reply.send(mount.start_ro(&name, with_hashmap));
        }
        VfsRequest::StopRo { name, reply } => {
            let _ = reply.send(mount.stop_ro(&name));
        }
        VfsRequest::GetHash { session, vpath, reply } => {
            let _ = reply.send(mount.get_hash(&session, &vpath));
        }
        VfsRequest::GetFileBlockHashes { session, vpath, reply } => {
            let _ = reply.send(mount.get_file_block_hashes(&session, &vpath));
        }
        VfsRequest::GetDirChildrenHashes { session, vpath, reply } => {
            let _ = reply.send(mount.get_dir_children_hashes(&session, &vpath));
        }
        VfsRequest::PhysicalPath { session, vpath, reply } => {
            let _ = reply.send(mount.physical_path(&session, &vpath));
        }
        VfsRequest::UpdateLogIndex { seq_no, reply } => {
            let _ = reply.send(mount.update_log_index(seq_no));
        }
        VfsRequest::TruncateLog { seq_no, reply } => {
            let _ = reply.send(mount.truncate_log(seq_no));
        }
        VfsRequest::ReadLogs { min_seq, max_seq, reply } => {
            let _ = reply.send(mount.read_logs(min_seq, max_seq));
        }
        VfsRequest::AppendLogs { bytes, reply } => {
            let _ = reply.send(mount.append_logs(&bytes));
        }
        VfsRequest::LastLogSeqNo(reply) => {
            let _ = reply.send(mount.last_log_seq_no());
        }
        VfsRequest::LogHashBySeqNo { seq_no, reply } => {
            let _ = reply.send(mount.log_hash_by_seq_no(seq_no));
        }
    }
}
