//! User input pool.
//!
//! Admits signed user inputs, enforces the `(pubkey, nonce)` replay
//! window and the per-round byte budget, and keeps the canonical
//! digest-ordered candidate view the stage engine proposes from.
//!
//! The pool is a synchronous state machine like the stage engine: the
//! runner routes `UserInputSubmitted` / `NonUnlInputsReceived` /
//! `LedgerCommitted` events here and executes the returned actions.

mod state;

pub use state::{PoolConfig, PoolState};
