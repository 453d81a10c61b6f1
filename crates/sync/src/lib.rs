//! State and log synchronization.
//!
//! Two workers bring a lagging or forked node back to the UNL-agreed
//! state:
//!
//! - [`StateSyncManager`] pulls missing vfs subtrees from peers by hash
//!   (recursive descent over directories, per-block for files). Used by
//!   nodes that do not keep full history.
//! - [`LogSyncManager`] pulls vfs op-log records instead, preserving
//!   replayability. Full-history nodes cannot block-sync: it would skip
//!   the intervening log records a third party needs for replay.
//!
//! Both workers resubmit an unanswered request after `0.7 × roundtime`
//! and abandon the whole attempt after [`ABANDON_THRESHOLD`]
//! resubmissions of any one request; the node then stays where it is
//! and retries on the next divergent round.

mod log_sync;
mod state_sync;

pub use log_sync::{LogSyncManager, LogSyncOutcome};
pub use state_sync::{StateSyncManager, StateSyncOutcome, SyncTarget};

/// Resubmissions of a single request before the sync attempt is
/// abandoned.
pub const ABANDON_THRESHOLD: u32 = 10;
