//! Full replication: every member owns every segment.

use crate::partitioning::factory::{normalize_capacity_factors, same_or_new};
use crate::partitioning::{ConsistentHash, ConsistentHashFactory};
use crate::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Every member with a non-zero capacity factor owns every segment.
/// Primary ownership is spread round-robin.
#[derive(Debug, Clone, Default)]
pub struct ReplicatedConsistentHashFactory;

impl ReplicatedConsistentHashFactory {
    pub fn new() -> Self {
        Self
    }

    fn place(
        num_segments: usize,
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
        previous: Option<&ConsistentHash>,
    ) -> ConsistentHash {
        assert!(!members.is_empty(), "members list cannot be empty");
        let factors = normalize_capacity_factors(members, capacity_factors);
        let eligible: Vec<Address> = members
            .iter()
            .filter(|member| {
                factors
                    .as_ref()
                    .and_then(|f| f.get(member).copied())
                    .unwrap_or(1.0)
                    > 0.0
            })
            .copied()
            .collect();
        assert!(
            !eligible.is_empty(),
            "at least one member must have a non-zero capacity factor"
        );

        let segment_owners = (0..num_segments)
            .map(|segment| {
                let kept_primary = previous
                    .and_then(|ch| ch.locate_primary_owner_for_segment(segment))
                    .filter(|primary| eligible.contains(primary));
                let primary = kept_primary.unwrap_or(eligible[segment % eligible.len()]);

                let mut owners = Vec::with_capacity(eligible.len());
                owners.push(primary);
                owners.extend(eligible.iter().filter(|m| **m != primary).copied());
                owners
            })
            .collect();

        ConsistentHash::from_parts(eligible.len(), members.to_vec(), factors, segment_owners)
    }
}

impl ConsistentHashFactory for ReplicatedConsistentHashFactory {
    fn create(
        &self,
        _num_owners: usize,
        num_segments: usize,
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> Arc<ConsistentHash> {
        Arc::new(Self::place(num_segments, members, capacity_factors, None))
    }

    fn update_members(
        &self,
        base: &Arc<ConsistentHash>,
        new_members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> Arc<ConsistentHash> {
        let updated = Self::place(base.num_segments(), new_members, capacity_factors, Some(base));
        same_or_new(base, updated)
    }

    fn rebalance(&self, base: &Arc<ConsistentHash>) -> Arc<ConsistentHash> {
        let rebalanced = Self::place(
            base.num_segments(),
            base.members(),
            base.capacity_factors(),
            None,
        );
        same_or_new(base, rebalanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(ids: &[u64]) -> Vec<Address> {
        ids.iter().map(|id| Address::new(*id)).collect()
    }

    #[test]
    fn test_every_member_owns_every_segment() {
        let factory = ReplicatedConsistentHashFactory::new();
        let members = addrs(&[1, 2, 3]);
        let ch = factory.create(1, 6, &members, None);

        assert_eq!(ch.num_owners(), 3);
        for segment in 0..6 {
            assert_eq!(ch.locate_owners_for_segment(segment).len(), 3);
        }
        assert_eq!(ch.primary_segments_for_owner(&members[0]).len(), 2);
        assert_eq!(ch.primary_segments_for_owner(&members[2]).len(), 2);
    }

    #[test]
    fn test_update_members_keeps_surviving_primaries() {
        let factory = ReplicatedConsistentHashFactory::new();
        let ch = factory.create(1, 6, &addrs(&[1, 2, 3]), None);
        let updated = factory.update_members(&ch, &addrs(&[1, 2]), None);

        for segment in 0..6 {
            let before = ch.locate_primary_owner_for_segment(segment);
            let after = updated.locate_primary_owner_for_segment(segment);
            if before != Some(Address::new(3)) {
                assert_eq!(before, after);
            }
            assert_eq!(updated.locate_owners_for_segment(segment).len(), 2);
        }

        let rebalanced = factory.rebalance(&updated);
        assert_eq!(rebalanced.primary_segments_for_owner(&Address::new(1)).len(), 3);
    }

    #[test]
    fn test_noop_update_is_identity() {
        let factory = ReplicatedConsistentHashFactory::new();
        let members = addrs(&[1, 2]);
        let ch = factory.create(1, 4, &members, None);
        assert!(Arc::ptr_eq(&ch, &factory.update_members(&ch, &members, None)));
        assert!(Arc::ptr_eq(&ch, &factory.rebalance(&ch)));
    }
}
