//! Consensus engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether proposals flow over the open mesh or only between UNL peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    /// Proposals are relayed to any connected peer.
    Public,
    /// Proposals only travel between UNL members.
    Private,
}

/// Tunables for the stage engine.
///
/// `roundtime` and `stage_slice` shape the timer cadence; `threshold`
/// feeds the UNL quorum. Bounds are validated at config load.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Full round duration, ms. Bounds: `[1, 3_600_000]`.
    pub roundtime_ms: u32,
    /// Percent of the round each stage occupies. Bounds: `[1, 33]`.
    pub stage_slice_percent: u8,
    /// Consensus mode.
    pub mode: ConsensusMode,
    /// Whether this node keeps full history (log sync instead of block
    /// sync on divergence).
    pub full_history: bool,
}

impl ConsensusConfig {
    /// Duration of one stage slice.
    pub fn stage_slice(&self) -> Duration {
        let ms = (self.roundtime_ms as u64 * self.stage_slice_percent as u64) / 100;
        // A 1 ms round still has to tick.
        Duration::from_millis(ms.max(1))
    }

    /// How long an unanswered sync request waits before resubmission.
    pub fn resubmit_timeout(&self) -> Duration {
        Duration::from_millis((self.roundtime_ms as u64 * 7) / 10)
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            roundtime_ms: 1000,
            stage_slice_percent: 25,
            mode: ConsensusMode::Private,
            full_history: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_and_resubmit_derivation() {
        let config = ConsensusConfig::default();
        assert_eq!(config.stage_slice(), Duration::from_millis(250));
        assert_eq!(config.resubmit_timeout(), Duration::from_millis(700));
    }

    #[test]
    fn minimum_roundtime_still_ticks() {
        let config = ConsensusConfig {
            roundtime_ms: 1,
            ..Default::default()
        };
        assert_eq!(config.stage_slice(), Duration::from_millis(1));
    }
}
