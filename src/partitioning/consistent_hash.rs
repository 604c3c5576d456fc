//! Immutable segment ownership assignment.

use crate::types::{Address, Segment};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Which members own which segments.
///
/// Instances are produced by a [`ConsistentHashFactory`](super::ConsistentHashFactory)
/// and never mutated; every transition yields a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_owners: usize,
    members: Vec<Address>,
    capacity_factors: Option<BTreeMap<Address, f32>>,
    segment_owners: Vec<Vec<Address>>,
}

impl ConsistentHash {
    /// Build a hash from its parts without validation.
    pub(crate) fn from_parts(
        num_owners: usize,
        members: Vec<Address>,
        capacity_factors: Option<BTreeMap<Address, f32>>,
        segment_owners: Vec<Vec<Address>>,
    ) -> Self {
        debug_assert!(segment_owners
            .iter()
            .flatten()
            .all(|owner| members.contains(owner)));
        Self {
            num_owners,
            members,
            capacity_factors,
            segment_owners,
        }
    }

    /// Requested number of owners per segment.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    /// Number of segments.
    pub fn num_segments(&self) -> usize {
        self.segment_owners.len()
    }

    /// Members in join order.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Capacity factors, if any member declared one.
    pub fn capacity_factors(&self) -> Option<&BTreeMap<Address, f32>> {
        self.capacity_factors.as_ref()
    }

    /// Capacity factor of a member, 1.0 when not configured.
    pub fn capacity_factor(&self, member: &Address) -> f32 {
        self.capacity_factors
            .as_ref()
            .and_then(|factors| factors.get(member).copied())
            .unwrap_or(1.0)
    }

    /// Owners of a segment, primary first.
    ///
    /// # Panics
    ///
    /// Panics if `segment` is out of range.
    pub fn locate_owners_for_segment(&self, segment: Segment) -> &[Address] {
        &self.segment_owners[segment]
    }

    /// Primary owner of a segment.
    pub fn locate_primary_owner_for_segment(&self, segment: Segment) -> Option<Address> {
        self.segment_owners
            .get(segment)
            .and_then(|owners| owners.first().copied())
    }

    /// All segments a member owns, as primary or backup.
    pub fn segments_for_owner(&self, owner: &Address) -> BTreeSet<Segment> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(owner))
            .map(|(segment, _)| segment)
            .collect()
    }

    /// Segments a member owns as primary.
    pub fn primary_segments_for_owner(&self, owner: &Address) -> BTreeSet<Segment> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(owner))
            .map(|(segment, _)| segment)
            .collect()
    }

    /// Whether `member` owns `segment`.
    pub fn is_segment_local_to(&self, member: &Address, segment: Segment) -> bool {
        self.segment_owners
            .get(segment)
            .is_some_and(|owners| owners.contains(member))
    }

    /// Whether `member` is part of this hash.
    pub fn contains_member(&self, member: &Address) -> bool {
        self.members.contains(member)
    }

    pub(crate) fn segment_owners(&self) -> &[Vec<Address>] {
        &self.segment_owners
    }
}

impl fmt::Display for ConsistentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConsistentHash(owners={}, segments={}, members={:?})",
            self.num_owners,
            self.num_segments(),
            self.members
        )?;
        for (segment, owners) in self.segment_owners.iter().enumerate() {
            write!(f, "\n  {:>4}:", segment)?;
            for owner in owners {
                write!(f, " {}", owner)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: u64) -> Address {
        Address::new(id)
    }

    fn sample() -> ConsistentHash {
        ConsistentHash::from_parts(
            2,
            vec![addr(1), addr(2), addr(3)],
            None,
            vec![
                vec![addr(1), addr(2)],
                vec![addr(2), addr(3)],
                vec![addr(3), addr(1)],
                vec![addr(1), addr(3)],
            ],
        )
    }

    #[test]
    fn test_owner_queries() {
        let ch = sample();
        assert_eq!(ch.num_segments(), 4);
        assert_eq!(ch.locate_owners_for_segment(1), &[addr(2), addr(3)]);
        assert_eq!(ch.locate_primary_owner_for_segment(2), Some(addr(3)));
        assert_eq!(ch.locate_primary_owner_for_segment(9), None);
        assert_eq!(
            ch.segments_for_owner(&addr(1)),
            [0, 2, 3].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(
            ch.primary_segments_for_owner(&addr(1)),
            [0, 3].into_iter().collect::<BTreeSet<_>>()
        );
        assert!(ch.is_segment_local_to(&addr(3), 1));
        assert!(!ch.is_segment_local_to(&addr(1), 1));
    }

    #[test]
    fn test_capacity_factor_defaults_to_one() {
        let ch = sample();
        assert_eq!(ch.capacity_factor(&addr(1)), 1.0);

        let mut factors = BTreeMap::new();
        factors.insert(addr(1), 2.5);
        let weighted = ConsistentHash::from_parts(1, vec![addr(1)], Some(factors), vec![vec![addr(1)]]);
        assert_eq!(weighted.capacity_factor(&addr(1)), 2.5);
    }

    #[test]
    fn test_display_lists_every_segment() {
        let text = sample().to_string();
        assert!(text.contains("segments=4"));
        assert!(text.contains("3: node-1 node-3"));
    }
}
