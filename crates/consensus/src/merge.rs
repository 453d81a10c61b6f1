//! Pure merge arithmetic for stage transitions.
//!
//! Everything here is a function of the proposal multiset and the quorum
//! size, with no hidden state, so the same proposals produce the same
//! merged fields on every node regardless of arrival order.

use hotpocket_types::{FieldHasher, Hash, Proposal, PublicKey};
use std::collections::{BTreeMap, BTreeSet};

/// Quorum-merge the `users` and `input_ordered_hashes` sets.
///
/// An element survives iff it appears in proposals from at least
/// `quorum` distinct signers. Elements below quorum are dropped, not
/// carried.
pub fn merge_sets(
    proposals: &[&Proposal],
    quorum: usize,
) -> (BTreeSet<PublicKey>, BTreeSet<Hash>) {
    let mut user_votes: BTreeMap<PublicKey, usize> = BTreeMap::new();
    let mut input_votes: BTreeMap<Hash, usize> = BTreeMap::new();

    for p in proposals {
        for user in &p.users {
            *user_votes.entry(*user).or_default() += 1;
        }
        for hash in &p.input_ordered_hashes {
            *input_votes.entry(*hash).or_default() += 1;
        }
    }

    let users = user_votes
        .into_iter()
        .filter(|(_, votes)| *votes >= quorum)
        .map(|(user, _)| user)
        .collect();
    let inputs = input_votes
        .into_iter()
        .filter(|(_, votes)| *votes >= quorum)
        .map(|(hash, _)| hash)
        .collect();

    (users, inputs)
}

/// Median proposal time, rounded to the time granularity.
///
/// An even count takes the lower of the two middle values, and rounding
/// ties also resolve low, so adversarial clock skew cannot push the
/// round time up through tie manipulation.
pub fn median_time(proposals: &[&Proposal], granularity_ms: u32) -> u64 {
    if proposals.is_empty() {
        return 0;
    }
    let mut times: Vec<u64> = proposals.iter().map(|p| p.time).collect();
    times.sort_unstable();

    // Lower middle for even counts.
    let median = times[(times.len() - 1) / 2];

    let g = granularity_ms.max(1) as u64;
    let rem = median % g;
    if rem * 2 > g {
        median - rem + g
    } else {
        median - rem
    }
}

/// XOR-fold the contributing signers' node nonces into the group nonce.
pub fn merge_group_nonce(proposals: &[&Proposal]) -> Hash {
    let mut nonce = Hash::ZERO;
    for p in proposals {
        nonce.xor(&p.node_nonce);
    }
    nonce
}

/// Digest of an ordered hash set; the empty set digests to zero.
pub fn hash_of_hash_set(set: &BTreeSet<Hash>) -> Hash {
    if set.is_empty() {
        return Hash::ZERO;
    }
    let mut hasher = FieldHasher::new();
    hasher.add_hash_set(set);
    hasher.finish()
}

/// Digest of an ordered user set; the empty set digests to zero.
pub fn hash_of_user_set(set: &BTreeSet<PublicKey>) -> Hash {
    if set.is_empty() {
        return Hash::ZERO;
    }
    let mut hasher = FieldHasher::new();
    hasher.add_pubkey_set(set);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpocket_types::test_utils::{test_hash, test_keypair};
    use hotpocket_types::Stage;

    fn proposal(seed: u8, time: u64, inputs: &[u8], users: &[u8]) -> Proposal {
        let kp = test_keypair(seed);
        let mut p = Proposal::build(Stage::Stage0, time, 1000);
        p.node_nonce = test_hash(seed);
        for i in inputs {
            p.input_ordered_hashes.insert(test_hash(*i));
        }
        for u in users {
            p.users.insert(test_keypair(*u).public_key());
        }
        p.sign(&kp);
        p
    }

    #[test]
    fn elements_below_quorum_are_dropped() {
        // A proposes {x}, B proposes {y}, quorum 2: merged set is empty.
        let a = proposal(1, 0, &[10], &[1]);
        let b = proposal(2, 0, &[20], &[2]);
        let (users, inputs) = merge_sets(&[&a, &b], 2);
        assert!(users.is_empty());
        assert!(inputs.is_empty());
    }

    #[test]
    fn elements_at_quorum_survive() {
        let a = proposal(1, 0, &[10, 30], &[1]);
        let b = proposal(2, 0, &[10, 20], &[1]);
        let (users, inputs) = merge_sets(&[&a, &b], 2);
        assert_eq!(inputs, [test_hash(10)].into_iter().collect());
        assert_eq!(
            users,
            [test_keypair(1).public_key()].into_iter().collect()
        );
    }

    #[test]
    fn merge_is_order_independent() {
        let a = proposal(1, 0, &[10, 20], &[1, 2]);
        let b = proposal(2, 0, &[20], &[2]);
        let c = proposal(3, 0, &[20, 10], &[2, 1]);

        let fwd = merge_sets(&[&a, &b, &c], 2);
        let rev = merge_sets(&[&c, &b, &a], 2);
        assert_eq!(fwd, rev);

        assert_eq!(merge_group_nonce(&[&a, &b, &c]), merge_group_nonce(&[&c, &a, &b]));
    }

    #[test]
    fn median_takes_lower_middle() {
        let a = proposal(1, 1000, &[], &[]);
        let b = proposal(2, 2000, &[], &[]);
        let c = proposal(3, 3000, &[], &[]);
        let d = proposal(4, 9000, &[], &[]);

        // Odd count: plain middle.
        assert_eq!(median_time(&[&a, &b, &c], 1), 2000);
        // Even count: lower middle, immune to one high outlier.
        assert_eq!(median_time(&[&a, &b, &c, &d], 1), 2000);
    }

    #[test]
    fn median_rounds_to_granularity_ties_low() {
        let p = proposal(1, 1500, &[], &[]);
        // 1500 on a 1000 ms grid is an exact tie: resolve low.
        assert_eq!(median_time(&[&p], 1000), 1000);
        let p = proposal(1, 1501, &[], &[]);
        assert_eq!(median_time(&[&p], 1000), 2000);
        let p = proposal(1, 1499, &[], &[]);
        assert_eq!(median_time(&[&p], 1000), 1000);
    }

    #[test]
    fn empty_set_digests_to_zero() {
        assert_eq!(hash_of_hash_set(&BTreeSet::new()), Hash::ZERO);
        assert_eq!(hash_of_user_set(&BTreeSet::new()), Hash::ZERO);
        assert_ne!(
            hash_of_hash_set(&[test_hash(1)].into_iter().collect()),
            Hash::ZERO
        );
    }

    #[test]
    fn group_nonce_cancels_duplicates() {
        let a = proposal(1, 0, &[], &[]);
        // XOR of a nonce with itself is zero.
        assert_eq!(merge_group_nonce(&[&a, &a]), Hash::ZERO);
    }
}
