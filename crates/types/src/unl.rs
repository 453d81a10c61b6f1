//! The Unique Node List: the trusted-signer set and its quorum math.

use crate::{Proposal, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lowest admissible threshold percent.
pub const MIN_THRESHOLD: u8 = 1;
/// Highest admissible threshold percent (unanimity).
pub const MAX_THRESHOLD: u8 = 100;

/// The set of public keys whose proposals count toward quorum.
///
/// Loaded from config at startup; mutated only when a patch-file change
/// wins consensus, between rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unl {
    members: BTreeSet<PublicKey>,
    threshold_percent: u8,
}

impl Unl {
    /// Build a UNL; rejects a threshold outside `[1, 100]`.
    pub fn new(members: BTreeSet<PublicKey>, threshold_percent: u8) -> Result<Self, UnlError> {
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold_percent) {
            return Err(UnlError::ThresholdOutOfRange(threshold_percent));
        }
        Ok(Self {
            members,
            threshold_percent,
        })
    }

    /// Whether `pk` is a trusted signer.
    pub fn exists(&self, pk: &PublicKey) -> bool {
        self.members.contains(pk)
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Signatures required for quorum: `ceil(n * threshold / 100)`.
    pub fn quorum(&self) -> usize {
        (self.members.len() * self.threshold_percent as usize).div_ceil(100)
    }

    /// Configured threshold percent.
    pub fn threshold_percent(&self) -> u8 {
        self.threshold_percent
    }

    /// Iterate members in key order.
    pub fn members(&self) -> impl Iterator<Item = &PublicKey> {
        self.members.iter()
    }

    /// Replace the member set (patch-file apply, between rounds only).
    pub fn replace_members(&mut self, members: BTreeSet<PublicKey>) {
        self.members = members;
    }

    /// The time granularity held by a strict majority of the UNL.
    ///
    /// Counts distinct UNL signers per `time_config` value over the given
    /// proposal window; a value held by more than half the UNL wins,
    /// otherwise the local configured value stands.
    pub fn majority_time_config<'a>(
        &self,
        window: impl IntoIterator<Item = &'a Proposal>,
        local: u32,
    ) -> u32 {
        let mut signers_by_config: BTreeMap<u32, BTreeSet<PublicKey>> = BTreeMap::new();
        for p in window {
            if self.exists(&p.pubkey) {
                signers_by_config
                    .entry(p.time_config)
                    .or_default()
                    .insert(p.pubkey);
            }
        }

        let majority = self.members.len() / 2;
        signers_by_config
            .into_iter()
            .find(|(_, signers)| signers.len() > majority)
            .map(|(config, _)| config)
            .unwrap_or(local)
    }
}

/// Error constructing a UNL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnlError {
    /// Threshold percent outside `[1, 100]`.
    #[error("threshold {0}% outside [1, 100]")]
    ThresholdOutOfRange(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_keypair, test_unl};
    use crate::Stage;

    #[test]
    fn quorum_rounds_up() {
        assert_eq!(test_unl(&[1, 2, 3], 67).quorum(), 3);
        assert_eq!(test_unl(&[1, 2, 3], 66).quorum(), 2);
        assert_eq!(test_unl(&[1, 2, 3, 4], 80).quorum(), 4);
        assert_eq!(test_unl(&[1, 2, 3, 4, 5], 80).quorum(), 4);
    }

    #[test]
    fn unanimity_at_full_threshold() {
        let unl = test_unl(&[1, 2, 3, 4, 5], 100);
        assert_eq!(unl.quorum(), unl.size());
    }

    #[test]
    fn threshold_bounds_enforced() {
        assert!(Unl::new(BTreeSet::new(), 0).is_err());
        assert!(Unl::new(BTreeSet::new(), 101).is_err());
        assert!(Unl::new(BTreeSet::new(), 1).is_ok());
    }

    #[test]
    fn membership_checks() {
        let unl = test_unl(&[1, 2], 80);
        assert!(unl.exists(&test_keypair(1).public_key()));
        assert!(!unl.exists(&test_keypair(9).public_key()));
    }

    fn proposal_with_time_config(seed: u8, time_config: u32) -> Proposal {
        let kp = test_keypair(seed);
        let mut p = Proposal::build(Stage::Stage0, 0, time_config);
        p.sign(&kp);
        p
    }

    #[test]
    fn majority_time_config_needs_strict_majority() {
        let unl = test_unl(&[1, 2, 3], 80);

        // Two of three agree on 2000.
        let window = vec![
            proposal_with_time_config(1, 2000),
            proposal_with_time_config(2, 2000),
            proposal_with_time_config(3, 1000),
        ];
        assert_eq!(unl.majority_time_config(window.iter(), 1000), 2000);

        // A split falls back to the local value.
        let window = vec![
            proposal_with_time_config(1, 2000),
            proposal_with_time_config(2, 1000),
        ];
        assert_eq!(unl.majority_time_config(window.iter(), 500), 500);
    }

    #[test]
    fn majority_time_config_counts_distinct_signers() {
        let unl = test_unl(&[1, 2, 3], 80);
        // The same signer repeated does not add weight.
        let window = vec![
            proposal_with_time_config(1, 2000),
            proposal_with_time_config(1, 2000),
            proposal_with_time_config(1, 2000),
        ];
        assert_eq!(unl.majority_time_config(window.iter(), 1000), 1000);
    }

    #[test]
    fn non_unl_signers_are_ignored() {
        let unl = test_unl(&[1, 2, 3], 80);
        let window = vec![
            proposal_with_time_config(7, 2000),
            proposal_with_time_config(8, 2000),
            proposal_with_time_config(9, 2000),
        ];
        assert_eq!(unl.majority_time_config(window.iter(), 1000), 1000);
    }
}
