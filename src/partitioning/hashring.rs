//! Virtual-node hash ring and the placement strategy built on it.
//!
//! Each member is represented by multiple virtual nodes (vnodes), scaled by
//! its capacity factor. A segment is owned by the first distinct members found
//! walking clockwise from the midpoint of the segment's hash range. Because the
//! ring only depends on the member set, every node computes the same placement
//! independently of history.

use crate::partitioning::factory::{normalize_capacity_factors, same_or_new, update_members_with};
use crate::partitioning::{ConsistentHash, ConsistentHashFactory, KeyPartitioner};
use crate::types::Address;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Number of virtual nodes for a member with capacity factor 1.0.
pub const DEFAULT_VNODES_PER_NODE: usize = 64;

/// A consistent hash ring of members.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to owning member.
    vnodes: BTreeMap<u64, Address>,

    /// Members with at least one virtual node.
    members: Vec<Address>,
}

impl HashRing {
    /// Build a ring over `members`.
    ///
    /// A member gets `round(capacity_factor * vnodes_per_node)` virtual nodes,
    /// at least one unless its factor is zero.
    pub fn build(
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
        vnodes_per_node: usize,
    ) -> Self {
        let mut vnodes = BTreeMap::new();
        let mut ring_members = Vec::with_capacity(members.len());

        for member in members {
            let factor = capacity_factors
                .and_then(|factors| factors.get(member).copied())
                .unwrap_or(1.0);
            if factor <= 0.0 {
                continue;
            }
            let count = ((factor as f64 * vnodes_per_node as f64).round() as usize).max(1);
            for i in 0..count {
                let vnode_key = format!("{}:{}", member.id(), i);
                vnodes.insert(Self::hash_position(vnode_key.as_bytes()), *member);
            }
            ring_members.push(*member);
        }

        Self {
            vnodes,
            members: ring_members,
        }
    }

    /// Members present on the ring.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Up to `count` distinct members, walking clockwise from `position`.
    pub fn owners_at(&self, position: u64, count: usize) -> Vec<Address> {
        let wanted = count.min(self.members.len());
        let mut owners = Vec::with_capacity(wanted);
        if wanted == 0 {
            return owners;
        }

        let iter = self.vnodes.range(position..).chain(self.vnodes.range(..position));
        for (_, member) in iter {
            if !owners.contains(member) {
                owners.push(*member);
                if owners.len() >= wanted {
                    break;
                }
            }
        }
        owners
    }

    fn hash_position(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        hasher.finish()
    }
}

/// Placement derived purely from the member set via a [`HashRing`].
///
/// Ownership does not depend on the previous assignment, so it may move more
/// segments than [`DefaultConsistentHashFactory`](super::DefaultConsistentHashFactory)
/// on a rebalance, but all nodes agree on it without coordination.
#[derive(Debug, Clone)]
pub struct SyncConsistentHashFactory {
    vnodes_per_node: usize,
}

impl SyncConsistentHashFactory {
    /// Create a factory with the default virtual node count.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create a factory with a custom virtual node count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes_per_node: vnodes_per_node.max(1),
        }
    }

    fn place(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> ConsistentHash {
        assert!(!members.is_empty(), "members list cannot be empty");
        let factors = normalize_capacity_factors(members, capacity_factors);
        let ring = HashRing::build(members, factors.as_ref(), self.vnodes_per_node);
        assert!(
            !ring.members().is_empty(),
            "at least one member must have a non-zero capacity factor"
        );

        let partitioner = KeyPartitioner::new(num_segments);
        let segment_owners = (0..num_segments)
            .map(|segment| ring.owners_at(partitioner.segment_midpoint(segment), num_owners.max(1)))
            .collect();

        ConsistentHash::from_parts(num_owners, members.to_vec(), factors, segment_owners)
    }
}

impl Default for SyncConsistentHashFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistentHashFactory for SyncConsistentHashFactory {
    fn create(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> Arc<ConsistentHash> {
        Arc::new(self.place(num_owners, num_segments, members, capacity_factors))
    }

    fn update_members(
        &self,
        base: &Arc<ConsistentHash>,
        new_members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> Arc<ConsistentHash> {
        update_members_with(base, new_members, capacity_factors, self.requires_primary_owner(), || {
            self.create(base.num_owners(), base.num_segments(), new_members, capacity_factors)
        })
    }

    fn rebalance(&self, base: &Arc<ConsistentHash>) -> Arc<ConsistentHash> {
        let placed = self.place(
            base.num_owners(),
            base.num_segments(),
            base.members(),
            base.capacity_factors(),
        );
        same_or_new(base, placed)
    }
}
