//! Role controller: observer/validator switching on local health.

use hotpocket_types::Role;
use tracing::{info, warn};

/// Demote a validator after this many consecutive rounds without
/// contributing to quorum.
const MAX_UNCONTRIBUTED_ROUNDS: u64 = 10;

/// Demote a validator when it trails the UNL's ledger by more than this
/// many sequence numbers.
const MAX_SEQ_LAG: u64 = 4;

/// Tracks local health and decides the node's role.
///
/// A node that starts as observer never promotes. A node that starts as
/// validator demotes itself when it stops contributing or falls behind,
/// and re-promotes once it has caught back up to the UNL-agreed state.
pub struct RoleController {
    startup_role: Role,
    current: Role,
    consecutive_uncontributed: u64,
}

impl RoleController {
    /// Create with the configured startup role.
    pub fn new(startup_role: Role) -> Self {
        Self {
            startup_role,
            current: startup_role,
            consecutive_uncontributed: 0,
        }
    }

    /// The role currently in force.
    pub fn current(&self) -> Role {
        self.current
    }

    /// Fold in a round outcome. Returns the new role when it changed.
    pub fn on_round_outcome(&mut self, committed: bool, contributed: bool) -> Option<Role> {
        if self.startup_role == Role::Observer {
            return None;
        }

        if committed && contributed {
            self.consecutive_uncontributed = 0;
            return None;
        }
        self.consecutive_uncontributed += 1;

        if self.current == Role::Validator
            && self.consecutive_uncontributed >= MAX_UNCONTRIBUTED_ROUNDS
        {
            warn!(
                rounds = self.consecutive_uncontributed,
                "Not contributing to quorum, demoting to observer"
            );
            self.current = Role::Observer;
            return Some(Role::Observer);
        }
        None
    }

    /// Fold in the gap between our ledger and the UNL's advertised one.
    pub fn on_seq_lag(&mut self, behind_by: u64) -> Option<Role> {
        if self.startup_role == Role::Observer || self.current == Role::Observer {
            return None;
        }
        if behind_by > MAX_SEQ_LAG {
            warn!(behind_by, "Trailing the UNL ledger, demoting to observer");
            self.current = Role::Observer;
            return Some(Role::Observer);
        }
        None
    }

    /// The node caught up: vfs root matches the UNL-agreed root and the
    /// ledger tail is current. Re-promote if we started as a validator.
    pub fn on_caught_up(&mut self) -> Option<Role> {
        if self.startup_role == Role::Validator && self.current == Role::Observer {
            info!("Caught up with the UNL, re-promoting to validator");
            self.current = Role::Validator;
            self.consecutive_uncontributed = 0;
            return Some(Role::Validator);
        }
        None
    }
}
