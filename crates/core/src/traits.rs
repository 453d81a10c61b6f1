//! The state machine trait.

use crate::{Action, Event};
use std::time::Duration;

/// A synchronous, deterministic state machine.
///
/// Implementations mutate themselves and return actions; they never
/// perform I/O, read clocks, or draw randomness. The runner stamps the
/// current time before each call.
pub trait StateMachine {
    /// Advance the machine's notion of "now".
    ///
    /// Called by the runner before [`StateMachine::handle`].
    fn set_now(&mut self, now: Duration);

    /// Process one event, returning the actions it provokes.
    fn handle(&mut self, event: Event) -> Vec<Action>;
}
