//! Contract execution fence.
//!
//! Runs the deterministic contract binary against the RW vfs session:
//! materializes the round's admitted inputs into an input file tree,
//! spawns the binary with the configured identity, environment, and
//! resource limits, waits bounded by the exec timeout, then collects
//! outputs and reads the post-execution vfs roots.
//!
//! The fence does not own the vfs or decide promotion: on success the
//! RW session stays held for the stage engine to promote at commit; on
//! any failure the fence releases its acquisition without promoting and
//! the round continues without execution results.

mod fence;

pub use fence::{ContractConfig, ExecError, ExecLimits, ExecutionFence, ExecutionRequest};
