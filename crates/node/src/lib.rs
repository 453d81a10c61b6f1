//! HotPocket node: configuration, runner, peer mesh, user IO, and the
//! role controller.
//!
//! The binary (`hotpocket`) wires these together behind the `new`,
//! `rekey`, and `run` subcommands.

pub mod config;
pub mod network;
pub mod role;
pub mod runner;
pub mod timers;
pub mod user_io;

pub use config::{ContractCtx, HpConfig};
pub use runner::run;
