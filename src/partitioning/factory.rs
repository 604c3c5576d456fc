//! Consistent hash factories.
//!
//! A factory turns (owner count, segment count, members, capacity factors)
//! into a [`ConsistentHash`]. Every hash it returns satisfies:
//! - segment owners are drawn only from the members
//! - a segment has at most `num_owners` owners, truncated to the number of
//!   members with a non-zero capacity factor
//! - when a primary owner is required, every segment has one
//!
//! `update_members` and `rebalance` hand back the *same* `Arc` when nothing
//! changed, so callers can detect no-ops with [`Arc::ptr_eq`].

use crate::partitioning::ConsistentHash;
use crate::types::{Address, Segment};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Computes and transforms segment ownership.
pub trait ConsistentHashFactory: Send + Sync + fmt::Debug {
    /// Create a fresh hash over `members`.
    ///
    /// # Panics
    ///
    /// Panics if `members` is empty, or if every member has a zero capacity
    /// factor.
    fn create(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> Arc<ConsistentHash>;

    /// Restrict `base` to `new_members`, reassigning segments that lost
    /// every owner.
    fn update_members(
        &self,
        base: &Arc<ConsistentHash>,
        new_members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> Arc<ConsistentHash>;

    /// Compute a balanced assignment over `base`'s members.
    fn rebalance(&self, base: &Arc<ConsistentHash>) -> Arc<ConsistentHash>;

    /// Merge two hashes: per segment, the owners of `ch1` followed by the
    /// owners of `ch2` not already present.
    ///
    /// # Panics
    ///
    /// Panics if the segment counts differ.
    fn union(&self, ch1: &Arc<ConsistentHash>, ch2: &Arc<ConsistentHash>) -> Arc<ConsistentHash> {
        union_hashes(ch1, ch2)
    }

    /// Whether every segment must have a primary owner.
    fn requires_primary_owner(&self) -> bool {
        true
    }
}

/// Capacity-weighted balanced placement.
///
/// Primary and total ownership quotas are apportioned by capacity factor.
/// Rebalancing keeps existing owners while they stay within quota, which
/// bounds the number of segments that move.
#[derive(Debug, Clone, Default)]
pub struct DefaultConsistentHashFactory;

impl DefaultConsistentHashFactory {
    /// Create a new factory.
    pub fn new() -> Self {
        Self
    }

    fn build(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
        previous: Option<&[Vec<Address>]>,
    ) -> ConsistentHash {
        assert!(!members.is_empty(), "members list cannot be empty");
        let factors = normalize_capacity_factors(members, capacity_factors);
        let weights = member_weights(members, factors.as_ref());
        let owners = balance(num_owners, num_segments, members, &weights, previous);
        ConsistentHash::from_parts(num_owners, members.to_vec(), factors, owners)
    }
}

impl ConsistentHashFactory for DefaultConsistentHashFactory {
    fn create(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[Address],
        capacity_factors: Option<&BTreeMap<Address, f32>>,
    ) -> Arc<ConsistentHash> {
        Arc::new(self.build(num_owners, num_segments, members, capacity_factors, None))
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
        let rebalanced = self.build(
            base.num_owners(),
            base.num_segments(),
            base.members(),
            base.capacity_factors(),
            Some(base.segment_owners()),
        );
        same_or_new(base, rebalanced)
    }
}

/// Return `base` itself when `candidate` equals it.
pub(crate) fn same_or_new(base: &Arc<ConsistentHash>, candidate: ConsistentHash) -> Arc<ConsistentHash> {
    if **base == candidate {
        Arc::clone(base)
    } else {
        Arc::new(candidate)
    }
}

/// Drop factors of non-members; `None` when every factor is the default.
pub(crate) fn normalize_capacity_factors(
    members: &[Address],
    capacity_factors: Option<&BTreeMap<Address, f32>>,
) -> Option<BTreeMap<Address, f32>> {
    let factors: BTreeMap<Address, f32> = capacity_factors?
        .iter()
        .filter(|(member, _)| members.contains(member))
        .map(|(member, factor)| (*member, *factor))
        .collect();

    if factors.values().all(|factor| *factor == 1.0) {
        None
    } else {
        Some(factors)
    }
}

pub(crate) fn member_weights(
    members: &[Address],
    capacity_factors: Option<&BTreeMap<Address, f32>>,
) -> Vec<f64> {
    members
        .iter()
        .map(|member| {
            let factor = capacity_factors
                .and_then(|factors| factors.get(member).copied())
                .unwrap_or(1.0);
            f64::from(factor.max(0.0))
        })
        .collect()
}

/// Intersect every segment's owners with `new_members`; segments left without
/// an owner take the primary of a freshly computed placement.
pub(crate) fn update_members_with<F>(
    base: &Arc<ConsistentHash>,
    new_members: &[Address],
    capacity_factors: Option<&BTreeMap<Address, f32>>,
    requires_primary_owner: bool,
    mut fresh_placement: F,
) -> Arc<ConsistentHash>
where
    F: FnMut() -> Arc<ConsistentHash>,
{
    assert!(!new_members.is_empty(), "the new members list cannot be empty");

    let mut fresh: Option<Arc<ConsistentHash>> = None;
    let mut segment_owners = Vec::with_capacity(base.num_segments());

    for (segment, owners) in base.segment_owners().iter().enumerate() {
        let mut kept: Vec<Address> = owners
            .iter()
            .filter(|owner| new_members.contains(owner))
            .copied()
            .collect();

        if kept.is_empty() && requires_primary_owner {
            let placement = fresh.get_or_insert_with(&mut fresh_placement);
            if let Some(primary) = placement.locate_primary_owner_for_segment(segment) {
                kept.push(primary);
            }
        }
        segment_owners.push(kept);
    }

    let factors = normalize_capacity_factors(new_members, capacity_factors);
    let updated = ConsistentHash::from_parts(
        base.num_owners(),
        new_members.to_vec(),
        factors,
        segment_owners,
    );
    same_or_new(base, updated)
}

pub(crate) fn union_hashes(ch1: &Arc<ConsistentHash>, ch2: &Arc<ConsistentHash>) -> Arc<ConsistentHash> {
    assert_eq!(
        ch1.num_segments(),
        ch2.num_segments(),
        "cannot merge hashes with different segment counts"
    );

    let mut members = ch1.members().to_vec();
    for member in ch2.members() {
        if !members.contains(member) {
            members.push(*member);
        }
    }

    let segment_owners = ch1
        .segment_owners()
        .iter()
        .zip(ch2.segment_owners())
        .map(|(owners1, owners2)| {
            let mut merged = owners1.clone();
            for owner in owners2 {
                if !merged.contains(owner) {
                    merged.push(*owner);
                }
            }
            merged
        })
        .collect();

    let mut factors = ch2.capacity_factors().cloned().unwrap_or_default();
    if let Some(first) = ch1.capacity_factors() {
        factors.extend(first.iter().map(|(member, factor)| (*member, *factor)));
    }
    let factors = if factors.is_empty() { None } else { Some(factors) };

    Arc::new(ConsistentHash::from_parts(
        ch1.num_owners().max(ch2.num_owners()),
        members,
        factors,
        segment_owners,
    ))
}

/// Split `total` units proportionally to `weights`, no member above `cap`.
/// Largest remainders win the leftover units; ties go to the earlier member.
fn apportion(total: usize, weights: &[f64], cap: usize) -> Vec<usize> {
    let sum: f64 = weights.iter().sum();
    let mut quotas = vec![0usize; weights.len()];
    if sum <= 0.0 || total == 0 {
        return quotas;
    }

    let ideal: Vec<f64> = weights.iter().map(|w| total as f64 * w / sum).collect();
    for (quota, ideal) in quotas.iter_mut().zip(&ideal) {
        *quota = (ideal.floor() as usize).min(cap);
    }

    let mut assigned: usize = quotas.iter().sum();
    while assigned < total {
        let next = (0..weights.len())
            .filter(|&i| weights[i] > 0.0 && quotas[i] < cap)
            .max_by(|&a, &b| {
                let short_a = ideal[a] - quotas[a] as f64;
                let short_b = ideal[b] - quotas[b] as f64;
                short_a.total_cmp(&short_b).then(b.cmp(&a))
            });
        match next {
            Some(i) => {
                quotas[i] += 1;
                assigned += 1;
            }
            None => break,
        }
    }
    quotas
}

/// Eligible member with the highest score, skipping `excluded`.
fn pick_max<S>(weights: &[f64], excluded: &[usize], score: S) -> Option<usize>
where
    S: Fn(usize) -> i64,
{
    (0..weights.len())
        .filter(|i| weights[*i] > 0.0 && !excluded.contains(i))
        .max_by(|&a, &b| score(a).cmp(&score(b)).then(b.cmp(&a)))
}

fn balance(
    num_owners: usize,
    num_segments: usize,
    members: &[Address],
    weights: &[f64],
    previous: Option<&[Vec<Address>]>,
) -> Vec<Vec<Address>> {
    let eligible = weights.iter().filter(|w| **w > 0.0).count();
    assert!(
        eligible > 0,
        "at least one member must have a non-zero capacity factor"
    );
    let actual_owners = num_owners.max(1).min(eligible);

    let primary_quota = apportion(num_segments, weights, num_segments);
    let owner_quota = apportion(num_segments * actual_owners, weights, num_segments);

    let index: HashMap<Address, usize> = members
        .iter()
        .enumerate()
        .map(|(i, member)| (*member, i))
        .collect();
    let previous_owners = |segment: Segment| -> Vec<usize> {
        previous
            .and_then(|prev| prev.get(segment))
            .map(|owners| {
                owners
                    .iter()
                    .filter_map(|owner| index.get(owner).copied())
                    .filter(|&i| weights[i] > 0.0)
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut primary_count = vec![0usize; members.len()];
    let mut owner_count = vec![0usize; members.len()];
    let mut owners: Vec<Vec<usize>> = vec![Vec::with_capacity(actual_owners); num_segments];

    // Keep previous primaries within quota.
    for (segment, slot) in owners.iter_mut().enumerate() {
        if let Some(&primary) = previous_owners(segment).first() {
            if primary_count[primary] < primary_quota[primary] {
                slot.push(primary);
                primary_count[primary] += 1;
                owner_count[primary] += 1;
            }
        }
    }

    // Assign missing primaries, preferring a previous backup.
    for (segment, slot) in owners.iter_mut().enumerate() {
        if !slot.is_empty() {
            continue;
        }
        let promoted = previous_owners(segment)
            .into_iter()
            .find(|&m| primary_count[m] < primary_quota[m]);
        let primary = promoted.or_else(|| {
            pick_max(weights, &[], |m| {
                primary_quota[m] as i64 - primary_count[m] as i64
            })
        });
        if let Some(primary) = primary {
            slot.push(primary);
            primary_count[primary] += 1;
            owner_count[primary] += 1;
        }
    }

    // Keep previous backups, tolerating one segment over quota.
    for (segment, slot) in owners.iter_mut().enumerate() {
        for member in previous_owners(segment) {
            if slot.len() >= actual_owners {
                break;
            }
            if !slot.contains(&member) && owner_count[member] < owner_quota[member] + 1 {
                slot.push(member);
                owner_count[member] += 1;
            }
        }
    }

    // Fill the remaining backup slots.
    for slot in owners.iter_mut() {
        while slot.len() < actual_owners {
            let Some(member) = pick_max(weights, slot, |m| {
                owner_quota[m] as i64 - owner_count[m] as i64
            }) else {
                break;
            };
            slot.push(member);
            owner_count[member] += 1;
        }
    }

    owners
        .into_iter()
        .map(|slot| slot.into_iter().map(|i| members[i]).collect())
        .collect()
}
