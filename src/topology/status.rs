//! Coordinator-side rebalance state machine of one cache.
//!
//! [`ClusterCacheStatus`] is a plain value: every transition returns the
//! topologies the caller must publish, in order. It performs no I/O and takes
//! no locks, so the coordinator can drive it under a narrow critical section
//! and broadcast afterwards.

use crate::error::Error;
use crate::metrics::CoreMetrics;
use crate::partitioning::{ConsistentHash, ConsistentHashFactory};
use crate::topology::{CacheTopology, Phase, TopologyUpdateKind};
use crate::types::{Address, CacheJoinInfo, CacheName, PhaseFailure, TopologyId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Rebalancing state of a cache, as reported to operational tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalancingStatus {
    /// Rebalancing is disabled for the cache or the cluster.
    Suspended,
    /// A rebalance is needed but has not started.
    Pending,
    /// A rebalance is running.
    InProgress,
    /// Nothing to do.
    Complete,
}

impl fmt::Display for RebalancingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RebalancingStatus::Suspended => "SUSPENDED",
            RebalancingStatus::Pending => "PENDING",
            RebalancingStatus::InProgress => "IN_PROGRESS",
            RebalancingStatus::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// Progress of the phase currently awaiting confirmations.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDiagnostics {
    pub cache: CacheName,
    pub rebalance_id: u64,
    /// Topology that started the phase; confirmations must carry this id.
    pub topology_id: TopologyId,
    pub phase: Phase,
    /// Members that have not confirmed yet.
    pub missing: Vec<Address>,
    pub elapsed: Duration,
    /// Whether the phase has exceeded its grace period.
    pub stuck: bool,
}

#[derive(Debug)]
struct ConfirmationCollector {
    topology_id: TopologyId,
    expected: BTreeSet<Address>,
    confirmed: BTreeSet<Address>,
    started_at: Instant,
    stuck: bool,
}

impl ConfirmationCollector {
    fn new(topology_id: TopologyId, members: &[Address]) -> Self {
        Self {
            topology_id,
            expected: members.iter().copied().collect(),
            confirmed: BTreeSet::new(),
            started_at: Instant::now(),
            stuck: false,
        }
    }

    /// Record a confirmation. False if the sender was not expected or
    /// already confirmed.
    fn confirm(&mut self, member: Address) -> bool {
        self.expected.contains(&member) && self.confirmed.insert(member)
    }

    /// Leavers can no longer confirm; stop waiting for them.
    fn remove_leavers(&mut self, leavers: &[Address]) {
        for leaver in leavers {
            self.expected.remove(leaver);
            self.confirmed.remove(leaver);
        }
    }

    fn missing(&self) -> Vec<Address> {
        self.expected.difference(&self.confirmed).copied().collect()
    }

    fn is_complete(&self) -> bool {
        self.expected.iter().all(|member| self.confirmed.contains(member))
    }
}

/// Membership, topology and rebalance progress of one cache.
pub struct ClusterCacheStatus {
    cache: CacheName,
    join_info: CacheJoinInfo,
    factory: Arc<dyn ConsistentHashFactory>,
    /// Cache members in join order.
    members: Vec<Address>,
    capacity_factors: BTreeMap<Address, f32>,
    topology: Option<CacheTopology>,
    confirmations: Option<ConfirmationCollector>,
    cache_rebalancing_enabled: bool,
    cluster_rebalancing_enabled: bool,
    queued_rebalance: bool,
    rebalance_started_at: Option<Instant>,
    last_rebalance_id: u64,
    last_topology_id: TopologyId,
    last_failure: Option<Error>,
    metrics: Arc<CoreMetrics>,
}

impl ClusterCacheStatus {
    /// Status of a cache nobody has joined yet.
    pub fn new(
        cache: CacheName,
        join_info: CacheJoinInfo,
        cluster_rebalancing_enabled: bool,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let factory = join_info.hash_factory.build();
        Self {
            cache,
            join_info,
            factory,
            members: Vec::new(),
            capacity_factors: BTreeMap::new(),
            topology: None,
            confirmations: None,
            cache_rebalancing_enabled: true,
            cluster_rebalancing_enabled,
            queued_rebalance: false,
            rebalance_started_at: None,
            last_rebalance_id: 0,
            last_topology_id: 0,
            last_failure: None,
            metrics,
        }
    }

    /// Rebuild the status from what the members reported to a new
    /// coordinator.
    ///
    /// `last` is the most recent topology any member applied; `members` are
    /// the reporting members with their capacity factors. Numbering continues
    /// after `last`, and an interrupted rebalance is restarted from its
    /// current hash.
    pub fn recover(
        cache: CacheName,
        join_info: CacheJoinInfo,
        last: &CacheTopology,
        members: &[(Address, f32)],
        cluster_rebalancing_enabled: bool,
        metrics: Arc<CoreMetrics>,
    ) -> (Self, Vec<CacheTopology>) {
        let mut status = Self::new(cache, join_info, cluster_rebalancing_enabled, metrics);
        status.last_topology_id = last.topology_id;
        status.last_rebalance_id = last.rebalance_id;
        for (member, capacity_factor) in members {
            if !status.members.contains(member) {
                status.members.push(*member);
                status.capacity_factors.insert(*member, *capacity_factor);
            }
        }

        info!(
            cache = %status.cache,
            topology_id = last.topology_id,
            phase = %last.phase,
            members = ?status.members,
            "Recovering cache status"
        );
        if !status.has_capacity() {
            return (status, Vec::new());
        }

        let current = status.without_leavers(&last.current_ch);
        status.queued_rebalance = true;
        let mut published = vec![status.publish(
            Phase::NoRebalance,
            TopologyUpdateKind::ChUpdate,
            current,
            None,
        )];
        published.extend(status.start_queued_rebalance());
        (status, published)
    }

    pub fn cache(&self) -> &CacheName {
        &self.cache
    }

    pub fn join_info(&self) -> &CacheJoinInfo {
        &self.join_info
    }

    /// Cache members in join order.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Capacity factor a member joined with, 1.0 for non-members.
    pub fn capacity_factor(&self, member: &Address) -> f32 {
        self.capacity_factors.get(member).copied().unwrap_or(1.0)
    }

    /// Latest published topology.
    pub fn topology(&self) -> Option<&CacheTopology> {
        self.topology.as_ref()
    }

    /// Why the most recent aborted rebalance was abandoned.
    pub fn last_failure(&self) -> Option<&Error> {
        self.last_failure.as_ref()
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.cache_rebalancing_enabled && self.cluster_rebalancing_enabled
    }

    pub fn is_cache_rebalancing_enabled(&self) -> bool {
        self.cache_rebalancing_enabled
    }

    pub fn rebalancing_status(&self) -> RebalancingStatus {
        let in_progress = self
            .topology
            .as_ref()
            .is_some_and(|topology| topology.phase.is_rebalance());
        if !self.is_rebalancing_enabled() {
            RebalancingStatus::Suspended
        } else if in_progress {
            RebalancingStatus::InProgress
        } else if self.queued_rebalance {
            RebalancingStatus::Pending
        } else {
            RebalancingStatus::Complete
        }
    }

    /// A member joins the cache.
    pub fn add_member(&mut self, joiner: Address, capacity_factor: f32) -> Vec<CacheTopology> {
        if self.members.contains(&joiner) {
            debug!(cache = %self.cache, %joiner, "Member already joined");
            return Vec::new();
        }
        info!(cache = %self.cache, %joiner, capacity_factor, "Member joining cache");
        self.members.push(joiner);
        self.capacity_factors.insert(joiner, capacity_factor);

        if self.topology.is_some() {
            self.queued_rebalance = true;
            return self.start_queued_rebalance();
        }
        if !self.has_capacity() {
            debug!(cache = %self.cache, "No member with capacity yet, deferring initial topology");
            return Vec::new();
        }

        let initial = self.factory.create(
            self.join_info.num_owners,
            self.join_info.num_segments,
            &self.members,
            Some(&self.capacity_factors),
        );
        vec![self.publish(
            Phase::NoRebalance,
            TopologyUpdateKind::ChUpdate,
            initial,
            None,
        )]
    }

    /// Drop members missing from `view`.
    pub fn on_view_change(&mut self, view: &[Address]) -> Vec<CacheTopology> {
        let leavers: Vec<Address> = self
            .members
            .iter()
            .filter(|member| !view.contains(member))
            .copied()
            .collect();
        self.remove_members(&leavers)
    }

    /// Members leave the cache, gracefully or not.
    ///
    /// The next topology reassigns segments they solely owned. A leaver
    /// counts as having confirmed the current phase.
    pub fn remove_members(&mut self, leavers: &[Address]) -> Vec<CacheTopology> {
        let leavers: Vec<Address> = leavers
            .iter()
            .filter(|leaver| self.members.contains(leaver))
            .copied()
            .collect();
        if leavers.is_empty() {
            return Vec::new();
        }
        info!(cache = %self.cache, leavers = ?leavers, "Members left cache");
        self.members.retain(|member| !leavers.contains(member));
        for leaver in &leavers {
            self.capacity_factors.remove(leaver);
        }

        let Some(topology) = self.topology.clone() else {
            return Vec::new();
        };
        if !self.has_capacity() {
            warn!(cache = %self.cache, "No member with capacity left, dropping topology");
            self.topology = None;
            self.confirmations = None;
            self.rebalance_started_at = None;
            self.queued_rebalance = false;
            return Vec::new();
        }

        let current = self.without_leavers(&topology.current_ch);
        let pending = topology
            .pending_ch
            .as_ref()
            .map(|pending| self.without_leavers(pending));
        let mut published = vec![self.publish(
            topology.phase,
            TopologyUpdateKind::ChUpdate,
            current,
            pending,
        )];

        // Survivors may now be under-replicated.
        self.queued_rebalance = true;
        let phase_complete = match self.confirmations.as_mut() {
            Some(collector) => {
                collector.remove_leavers(&leavers);
                collector.is_complete()
            }
            None => false,
        };
        if phase_complete {
            published.extend(self.advance_phase());
        } else if !topology.phase.is_rebalance() {
            published.extend(self.start_queued_rebalance());
        }
        published
    }

    /// A member confirms the current phase. `topology_id` is the topology
    /// that started the phase or a later update within it.
    pub fn confirm_phase(
        &mut self,
        sender: Address,
        topology_id: TopologyId,
        failure: Option<PhaseFailure>,
    ) -> Vec<CacheTopology> {
        // Any topology published since the phase started identifies it.
        match self.confirmations.as_ref() {
            Some(collector)
                if collector.topology_id <= topology_id && topology_id <= self.last_topology_id => {}
            Some(collector) => {
                debug!(
                    cache = %self.cache,
                    %sender,
                    topology_id,
                    expected = collector.topology_id,
                    "Ignoring confirmation for another phase"
                );
                return Vec::new();
            }
            None => {
                debug!(cache = %self.cache, %sender, topology_id, "No phase awaiting confirmation");
                return Vec::new();
            }
        }

        if let Some(failure) = failure {
            if failure.fatal {
                return self.abort_rebalance(sender, &failure.message);
            }
            warn!(
                cache = %self.cache,
                %sender,
                topology_id,
                error = %failure.message,
                "Member reported a recoverable failure for rebalance phase"
            );
        }

        let phase_complete = match self.confirmations.as_mut() {
            Some(collector) => {
                if !collector.confirm(sender) {
                    debug!(cache = %self.cache, %sender, topology_id, "Duplicate or unexpected confirmation");
                    return Vec::new();
                }
                collector.is_complete()
            }
            None => false,
        };
        if phase_complete {
            self.advance_phase()
        } else {
            Vec::new()
        }
    }

    /// Start a rebalance regardless of the enabled flags.
    pub fn force_rebalance(&mut self) -> Vec<CacheTopology> {
        self.queued_rebalance = true;
        self.start_rebalance()
    }

    pub fn set_cache_rebalancing_enabled(&mut self, enabled: bool) -> Vec<CacheTopology> {
        self.cache_rebalancing_enabled = enabled;
        self.start_queued_rebalance()
    }

    pub fn set_cluster_rebalancing_enabled(&mut self, enabled: bool) -> Vec<CacheTopology> {
        self.cluster_rebalancing_enabled = enabled;
        self.start_queued_rebalance()
    }

    /// Progress of the phase awaiting confirmations, if any.
    pub fn diagnostics(&self, grace: Duration) -> Option<PhaseDiagnostics> {
        let collector = self.confirmations.as_ref()?;
        let topology = self.topology.as_ref()?;
        let elapsed = collector.started_at.elapsed();
        Some(PhaseDiagnostics {
            cache: self.cache.clone(),
            rebalance_id: topology.rebalance_id,
            topology_id: collector.topology_id,
            phase: topology.phase,
            missing: collector.missing(),
            elapsed,
            stuck: collector.stuck || elapsed >= grace,
        })
    }

    /// Flag the phase started by `topology_id` as stuck once `grace` has
    /// elapsed. Returns the missing members the first time only.
    pub fn mark_stuck(&mut self, topology_id: TopologyId, grace: Duration) -> Option<Vec<Address>> {
        let collector = self.confirmations.as_mut()?;
        if collector.topology_id != topology_id
            || collector.stuck
            || collector.started_at.elapsed() < grace
        {
            return None;
        }
        collector.stuck = true;
        self.metrics.rebalance_stuck_phases.inc();
        Some(collector.missing())
    }

    fn has_capacity(&self) -> bool {
        self.members
            .iter()
            .any(|member| self.capacity_factors.get(member).copied().unwrap_or(1.0) > 0.0)
    }

    fn update_members(&self, ch: &Arc<ConsistentHash>) -> Arc<ConsistentHash> {
        self.factory
            .update_members(ch, &self.members, Some(&self.capacity_factors))
    }

    /// `ch` without the members that left. Joiners only become owners
    /// through a rebalance.
    fn without_leavers(&self, ch: &Arc<ConsistentHash>) -> Arc<ConsistentHash> {
        let remaining: Vec<Address> = ch
            .members()
            .iter()
            .filter(|member| self.members.contains(member))
            .copied()
            .collect();
        let has_capacity = remaining
            .iter()
            .any(|member| self.capacity_factors.get(member).copied().unwrap_or(1.0) > 0.0);
        if has_capacity {
            self.factory
                .update_members(ch, &remaining, Some(&self.capacity_factors))
        } else {
            self.update_members(ch)
        }
    }

    fn start_queued_rebalance(&mut self) -> Vec<CacheTopology> {
        if !self.queued_rebalance || !self.is_rebalancing_enabled() {
            return Vec::new();
        }
        self.start_rebalance()
    }

    fn start_rebalance(&mut self) -> Vec<CacheTopology> {
        let Some(topology) = self.topology.as_ref() else {
            return Vec::new();
        };
        if topology.phase.is_rebalance() {
            self.queued_rebalance = true;
            return Vec::new();
        }
        self.queued_rebalance = false;
        if !self.has_capacity() {
            return Vec::new();
        }

        let current = self.without_leavers(&topology.current_ch);
        let base = self.update_members(&current);
        let balanced = self.factory.rebalance(&base);
        if balanced.segment_owners() == current.segment_owners() {
            // No segment changes hands, so there is no state to move.
            if *balanced == *topology.current_ch {
                debug!(cache = %self.cache, "Cache already balanced");
                return Vec::new();
            }
            return vec![self.publish(
                Phase::NoRebalance,
                TopologyUpdateKind::ChUpdate,
                balanced,
                None,
            )];
        }

        self.last_rebalance_id += 1;
        self.rebalance_started_at = Some(Instant::now());
        self.metrics.rebalance_started.inc();
        info!(
            cache = %self.cache,
            rebalance_id = self.last_rebalance_id,
            members = ?self.members,
            "Starting rebalance"
        );
        vec![self.publish(
            Phase::ReadOldWriteAll,
            TopologyUpdateKind::PhaseChange,
            current,
            Some(balanced),
        )]
    }

    fn advance_phase(&mut self) -> Vec<CacheTopology> {
        let Some(topology) = self.topology.clone() else {
            return Vec::new();
        };
        self.confirmations = None;

        let next = topology.phase.next();
        let mut published = Vec::new();
        match next {
            Phase::ReadOldWriteAll | Phase::ReadAllWriteAll | Phase::ReadNewWriteAll => {
                published.push(self.publish(
                    next,
                    TopologyUpdateKind::PhaseChange,
                    topology.current_ch,
                    topology.pending_ch,
                ));
            }
            Phase::Transitory => {
                let promoted = topology.pending_ch.unwrap_or(topology.current_ch);
                published.push(self.publish(
                    Phase::Transitory,
                    TopologyUpdateKind::PhaseChange,
                    promoted,
                    None,
                ));
            }
            Phase::NoRebalance => {
                published.push(self.publish(
                    Phase::NoRebalance,
                    TopologyUpdateKind::PhaseChange,
                    topology.current_ch,
                    None,
                ));
                let elapsed = self
                    .rebalance_started_at
                    .take()
                    .map(|started| started.elapsed())
                    .unwrap_or_default();
                self.metrics.record_rebalance(true, elapsed);
                info!(
                    cache = %self.cache,
                    rebalance_id = self.last_rebalance_id,
                    topology_id = self.last_topology_id,
                    ?elapsed,
                    "Rebalance completed"
                );
                published.extend(self.start_queued_rebalance());
            }
        }
        published
    }

    /// Abandon the rebalance, fall back to the current hash and retry.
    fn abort_rebalance(&mut self, sender: Address, reason: &str) -> Vec<CacheTopology> {
        let Some(topology) = self.topology.clone() else {
            return Vec::new();
        };
        let failure = Error::RebalanceAborted {
            cache: self.cache.clone(),
            reason: format!("{} reported: {}", sender, reason),
        };
        error!(
            cache = %self.cache,
            rebalance_id = topology.rebalance_id,
            error = %failure,
            "Rebalance aborted"
        );
        self.last_failure = Some(failure);
        self.confirmations = None;
        let elapsed = self
            .rebalance_started_at
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.metrics.record_rebalance(false, elapsed);

        let current = self.without_leavers(&topology.current_ch);
        let mut published = vec![self.publish(
            Phase::NoRebalance,
            TopologyUpdateKind::ChUpdate,
            current,
            None,
        )];
        self.queued_rebalance = true;
        published.extend(self.start_queued_rebalance());
        published
    }

    fn publish(
        &mut self,
        phase: Phase,
        kind: TopologyUpdateKind,
        current: Arc<ConsistentHash>,
        pending: Option<Arc<ConsistentHash>>,
    ) -> CacheTopology {
        self.last_topology_id += 1;
        let union = pending
            .as_ref()
            .map(|pending| self.factory.union(&current, pending));
        let topology = CacheTopology {
            topology_id: self.last_topology_id,
            rebalance_id: self.last_rebalance_id,
            phase,
            kind,
            current_ch: current,
            pending_ch: pending,
            union_ch: union,
            actual_members: self.members.clone(),
        };

        if topology.requires_confirmation() {
            self.confirmations = Some(ConfirmationCollector::new(
                topology.topology_id,
                &self.members,
            ));
        } else if kind == TopologyUpdateKind::PhaseChange {
            self.confirmations = None;
        }

        debug!(
            cache = %self.cache,
            topology_id = topology.topology_id,
            phase = %phase,
            ?kind,
            "Publishing topology"
        );
        self.topology = Some(topology.clone());
        topology
    }
}

impl fmt::Debug for ClusterCacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCacheStatus")
            .field("cache", &self.cache)
            .field("members", &self.members)
            .field("topology_id", &self.last_topology_id)
            .field("status", &self.rebalancing_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashFactoryKind;

    fn addr(id: u64) -> Address {
        Address::new(id)
    }

    fn join_info(num_owners: usize) -> CacheJoinInfo {
        CacheJoinInfo {
            num_owners,
            num_segments: 16,
            capacity_factor: 1.0,
            hash_factory: HashFactoryKind::Default,
        }
    }

    fn status(num_owners: usize) -> ClusterCacheStatus {
        ClusterCacheStatus::new(
            CacheName::new("c"),
            join_info(num_owners),
            true,
            Arc::new(CoreMetrics::new()),
        )
    }

    /// Confirm every phase until the cache is stable again.
    fn confirm_until_stable(status: &mut ClusterCacheStatus) -> Vec<CacheTopology> {
        let mut published = Vec::new();
        while let Some(diagnostics) = status.diagnostics(Duration::MAX) {
            for member in diagnostics.missing {
                published.extend(status.confirm_phase(member, diagnostics.topology_id, None));
            }
        }
        published
    }

    #[test]
    fn test_first_join_creates_initial_topology() {
        let mut status = status(2);
        let published = status.add_member(addr(1), 1.0);

        assert_eq!(published.len(), 1);
        let topology = &published[0];
        assert_eq!(topology.topology_id, 1);
        assert_eq!(topology.phase, Phase::NoRebalance);
        assert!(!topology.requires_confirmation());
        assert_eq!(topology.actual_members, vec![addr(1)]);
        assert_eq!(status.rebalancing_status(), RebalancingStatus::Complete);
    }

    #[test]
    fn test_join_runs_all_phases() {
        let mut status = status(2);
        status.add_member(addr(1), 1.0);
        let started = status.add_member(addr(2), 1.0);

        assert_eq!(started.len(), 1);
        assert_eq!(started[0].phase, Phase::ReadOldWriteAll);
        assert!(started[0].requires_confirmation());
        let pending = started[0].pending_ch.clone().unwrap();
        assert!(pending.contains_member(&addr(2)));
        assert_eq!(status.rebalancing_status(), RebalancingStatus::InProgress);

        assert!(status.confirm_phase(addr(1), 2, None).is_empty());
        let rawa = status.confirm_phase(addr(2), 2, None);
        assert_eq!(rawa[0].phase, Phase::ReadAllWriteAll);

        let rest = confirm_until_stable(&mut status);
        let phases: Vec<Phase> = rest.iter().map(|t| t.phase).collect();
        assert_eq!(
            phases,
            vec![Phase::ReadNewWriteAll, Phase::Transitory, Phase::NoRebalance]
        );
        let ids: Vec<TopologyId> = rest.iter().map(|t| t.topology_id).collect();
        assert_eq!(ids, vec![4, 5, 6]);

        let stable = rest.last().unwrap();
        assert_eq!(*stable.current_ch, *pending);
        assert!(stable.pending_ch.is_none());
        assert_eq!(status.rebalancing_status(), RebalancingStatus::Complete);
    }

    #[test]
    fn test_sole_owner_leaver_reassigned_in_next_topology() {
        let mut status = status(1);
        status.add_member(addr(1), 1.0);
        status.add_member(addr(2), 1.0);
        confirm_until_stable(&mut status);
        let before = status.topology().unwrap().clone();
        assert!(!before.current_ch.segments_for_owner(&addr(2)).is_empty());

        let published = status.on_view_change(&[addr(1)]);
        let next = &published[0];
        assert_eq!(next.topology_id, before.topology_id + 1);
        assert_eq!(next.kind, TopologyUpdateKind::ChUpdate);
        assert!(!next.requires_confirmation());
        for segment in 0..16 {
            assert_eq!(next.current_ch.locate_owners_for_segment(segment), &[addr(1)]);
        }
        assert!(status.diagnostics(Duration::MAX).is_none());
    }

    #[test]
    fn test_leaver_counts_as_confirmation() {
        let mut status = status(2);
        status.add_member(addr(1), 1.0);
        status.add_member(addr(2), 1.0);
        confirm_until_stable(&mut status);
        let started = status.add_member(addr(3), 1.0);
        let phase_id = started[0].topology_id;

        status.confirm_phase(addr(1), phase_id, None);
        status.confirm_phase(addr(2), phase_id, None);
        let published = status.remove_members(&[addr(3)]);

        assert_eq!(published[0].kind, TopologyUpdateKind::ChUpdate);
        assert_eq!(published[0].phase, Phase::ReadOldWriteAll);
        assert_eq!(published[1].phase, Phase::ReadAllWriteAll);
        assert!(!published[1].actual_members.contains(&addr(3)));
    }

    #[test]
    fn test_joiner_folded_into_next_phase() {
        let mut status = status(2);
        status.add_member(addr(1), 1.0);
        let started = status.add_member(addr(2), 1.0);
        let phase_id = started[0].topology_id;

        assert!(status.add_member(addr(3), 1.0).is_empty());
        assert_eq!(
            status.diagnostics(Duration::MAX).unwrap().missing,
            vec![addr(1), addr(2)]
        );

        status.confirm_phase(addr(1), phase_id, None);
        let rawa = status.confirm_phase(addr(2), phase_id, None);
        assert_eq!(rawa[0].phase, Phase::ReadAllWriteAll);
        assert_eq!(
            status.diagnostics(Duration::MAX).unwrap().missing,
            vec![addr(1), addr(2), addr(3)]
        );

        // The queued rebalance for node 3 starts right after this one ends.
        let rest = confirm_until_stable(&mut status);
        assert!(rest
            .iter()
            .any(|t| t.phase == Phase::ReadOldWriteAll && t.rebalance_id == 2));
        let stable = status.topology().unwrap();
        assert!(!stable.current_ch.segments_for_owner(&addr(3)).is_empty());
    }

    #[test]
    fn test_fatal_failure_aborts_and_retries() {
        let metrics = Arc::new(CoreMetrics::new());
        let mut status =
            ClusterCacheStatus::new(CacheName::new("c"), join_info(2), true, Arc::clone(&metrics));
        status.add_member(addr(1), 1.0);
        let started = status.add_member(addr(2), 1.0);
        let phase_id = started[0].topology_id;

        let published =
            status.confirm_phase(addr(2), phase_id, Some(PhaseFailure::fatal("state transfer failed")));
        assert_eq!(published[0].phase, Phase::NoRebalance);
        assert!(published[0].pending_ch.is_none());
        assert_eq!(published[1].phase, Phase::ReadOldWriteAll);
        assert_eq!(published[1].rebalance_id, 2);
        assert_eq!(metrics.rebalance_aborted.get(), 1);
        assert_eq!(metrics.rebalance_started.get(), 2);
        match status.last_failure() {
            Some(Error::RebalanceAborted { cache, reason }) => {
                assert_eq!(cache.as_str(), "c");
                assert!(reason.contains("state transfer failed"));
            }
            other => panic!("expected an aborted rebalance, got {:?}", other),
        }
    }

    #[test]
    fn test_recoverable_failure_still_confirms() {
        let mut status = status(2);
        status.add_member(addr(1), 1.0);
        let started = status.add_member(addr(2), 1.0);
        let phase_id = started[0].topology_id;

        status.confirm_phase(addr(1), phase_id, Some(PhaseFailure::recoverable("slow disk")));
        let next = status.confirm_phase(addr(2), phase_id, None);
        assert_eq!(next[0].phase, Phase::ReadAllWriteAll);
    }

    #[test]
    fn test_stale_confirmation_ignored() {
        let mut status = status(2);
        status.add_member(addr(1), 1.0);
        let started = status.add_member(addr(2), 1.0);
        let phase_id = started[0].topology_id;

        assert!(status.confirm_phase(addr(1), phase_id - 1, None).is_empty());
        assert!(status.confirm_phase(addr(1), phase_id + 1, None).is_empty());
        assert!(status.confirm_phase(addr(9), phase_id, None).is_empty());
        assert_eq!(status.diagnostics(Duration::MAX).unwrap().missing.len(), 2);
    }

    #[test]
    fn test_disabled_rebalancing_queues_until_enabled() {
        let mut status = status(2);
        status.add_member(addr(1), 1.0);
        status.set_cache_rebalancing_enabled(false);

        assert!(status.add_member(addr(2), 1.0).is_empty());
        assert_eq!(status.rebalancing_status(), RebalancingStatus::Suspended);

        let started = status.set_cache_rebalancing_enabled(true);
        assert_eq!(started[0].phase, Phase::ReadOldWriteAll);
    }

    #[test]
    fn test_force_rebalance_ignores_switch() {
        let mut status = status(2);
        status.add_member(addr(1), 1.0);
        status.set_cluster_rebalancing_enabled(false);
        status.add_member(addr(2), 1.0);

        let started = status.force_rebalance();
        assert_eq!(started[0].phase, Phase::ReadOldWriteAll);
    }

    #[test]
    fn test_stuck_phase_reported_once() {
        let metrics = Arc::new(CoreMetrics::new());
        let mut status =
            ClusterCacheStatus::new(CacheName::new("c"), join_info(2), true, Arc::clone(&metrics));
        status.add_member(addr(1), 1.0);
        let started = status.add_member(addr(2), 1.0);
        let phase_id = started[0].topology_id;

        assert!(status.mark_stuck(phase_id, Duration::from_secs(3600)).is_none());
        assert_eq!(
            status.mark_stuck(phase_id, Duration::ZERO),
            Some(vec![addr(1), addr(2)])
        );
        assert!(status.mark_stuck(phase_id, Duration::ZERO).is_none());
        assert!(status.diagnostics(Duration::from_secs(3600)).unwrap().stuck);
        assert_eq!(metrics.rebalance_stuck_phases.get(), 1);
    }

    #[test]
    fn test_recover_restarts_interrupted_rebalance() {
        let mut original = status(2);
        original.add_member(addr(1), 1.0);
        original.add_member(addr(2), 1.0);
        confirm_until_stable(&mut original);
        let interrupted = original.add_member(addr(3), 1.0).remove(0);
        assert_eq!(interrupted.phase, Phase::ReadOldWriteAll);

        let (recovered, published) = ClusterCacheStatus::recover(
            CacheName::new("c"),
            join_info(2),
            &interrupted,
            &[(addr(1), 1.0), (addr(3), 1.0)],
            true,
            Arc::new(CoreMetrics::new()),
        );

        assert_eq!(recovered.members(), &[addr(1), addr(3)]);
        assert_eq!(published[0].phase, Phase::NoRebalance);
        assert_eq!(published[0].topology_id, interrupted.topology_id + 1);
        assert!(!published[0].current_ch.contains_member(&addr(2)));
        assert!(published[0].current_ch.segments_for_owner(&addr(3)).is_empty());
        assert!(published
            .iter()
            .all(|t| !t.actual_members.contains(&addr(2))));
        assert_eq!(published[1].phase, Phase::ReadOldWriteAll);
        assert!(!published[1]
            .pending_ch
            .as_ref()
            .unwrap()
            .segments_for_owner(&addr(3))
            .is_empty());
    }

    #[test]
    fn test_replicated_joiner_reads_nothing_before_state_moves() {
        let mut status = ClusterCacheStatus::new(
            CacheName::new("c"),
            CacheJoinInfo {
                hash_factory: HashFactoryKind::Replicated,
                ..join_info(1)
            },
            true,
            Arc::new(CoreMetrics::new()),
        );
        status.add_member(addr(1), 1.0);
        let started = status.add_member(addr(2), 1.0);

        let rowa = &started[0];
        assert_eq!(rowa.topology_id, 2);
        assert_eq!(rowa.phase, Phase::ReadOldWriteAll);
        assert!(rowa.current_ch.segments_for_owner(&addr(2)).is_empty());
        for segment in 0..16 {
            assert_eq!(rowa.read_owners(segment), &[addr(1)]);
            assert!(rowa.write_owners(segment).contains(&addr(2)));
        }
        let pending = rowa.pending_ch.as_ref().unwrap();
        assert_eq!(pending.segments_for_owner(&addr(2)).len(), 16);

        confirm_until_stable(&mut status);
        let stable = status.topology().unwrap();
        assert_eq!(stable.current_ch.segments_for_owner(&addr(2)).len(), 16);
    }

    #[test]
    fn test_leaver_dropped_without_promoting_queued_joiner() {
        let mut status = status(1);
        status.add_member(addr(1), 1.0);
        status.add_member(addr(2), 1.0);
        confirm_until_stable(&mut status);
        status.set_cache_rebalancing_enabled(false);
        status.add_member(addr(3), 1.0);

        let published = status.remove_members(&[addr(2)]);
        let next = &published[0];
        assert!(!next.current_ch.contains_member(&addr(2)));
        assert!(next.current_ch.segments_for_owner(&addr(3)).is_empty());
        for segment in 0..16 {
            assert_eq!(next.current_ch.locate_owners_for_segment(segment), &[addr(1)]);
        }
    }
}
