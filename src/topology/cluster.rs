//! Coordinator side of the topology protocol.
//!
//! The coordinator (first member of the view) owns a [`ClusterCacheStatus`]
//! per cache. Every event is applied under the cache map lock, and the
//! resulting topologies are broadcast after the lock is released, in the order
//! they were produced.

use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::rpc::{MapResponseCollector, Response, ResponseValue, RpcManager, RpcOptions};
use crate::topology::status::{ClusterCacheStatus, PhaseDiagnostics, RebalancingStatus};
use crate::topology::CacheTopology;
use crate::types::{
    Address, CacheJoinInfo, CacheName, CacheStatusReport, Command, CommandKind, DeliverOrder,
    PhaseFailure, TopologyId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Drives rebalancing for every cache while this node is coordinator.
pub struct ClusterTopologyManager {
    this: Weak<ClusterTopologyManager>,
    rpc: Arc<RpcManager>,
    config: TopologyConfig,
    caches: Mutex<HashMap<CacheName, ClusterCacheStatus>>,
    /// Cluster-wide rebalancing switch.
    rebalancing_enabled: AtomicBool,
    view: RwLock<Vec<Address>>,
    metrics: Arc<CoreMetrics>,
}

impl ClusterTopologyManager {
    pub fn new(rpc: Arc<RpcManager>, config: TopologyConfig, metrics: Arc<CoreMetrics>) -> Arc<Self> {
        let view = rpc.members();
        let rebalancing_enabled = config.rebalancing_enabled;
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            rpc,
            config,
            caches: Mutex::new(HashMap::new()),
            rebalancing_enabled: AtomicBool::new(rebalancing_enabled),
            view: RwLock::new(view),
            metrics,
        })
    }

    pub fn address(&self) -> Address {
        self.rpc.address()
    }

    /// Current coordinator: first member of the installed view.
    pub fn coordinator(&self) -> Option<Address> {
        self.view.read().first().copied()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.address())
    }

    /// Cluster-wide switch state.
    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::Acquire)
    }

    /// Caches with coordinator state on this node.
    pub fn cache_names(&self) -> Vec<CacheName> {
        self.caches.lock().keys().cloned().collect()
    }

    /// Latest topology published for `cache`.
    pub fn cache_topology(&self, cache: &CacheName) -> Option<CacheTopology> {
        self.caches
            .lock()
            .get(cache)
            .and_then(|status| status.topology().cloned())
    }

    /// A member joins `cache`. Returns the topology the joiner starts from.
    pub fn handle_join(
        &self,
        cache: &CacheName,
        joiner: Address,
        info: CacheJoinInfo,
    ) -> Result<CacheTopology> {
        self.ensure_coordinator()?;
        let (published, topology) = {
            let mut caches = self.caches.lock();
            let status = caches.entry(cache.clone()).or_insert_with(|| {
                info!(cache = %cache, num_segments = info.num_segments, num_owners = info.num_owners, "Initializing cache status");
                ClusterCacheStatus::new(
                    cache.clone(),
                    info.clone(),
                    self.is_rebalancing_enabled(),
                    Arc::clone(&self.metrics),
                )
            });
            let published = status.add_member(joiner, info.capacity_factor);
            (published, status.topology().cloned())
        };
        self.broadcast(cache, published);
        topology.ok_or_else(|| {
            Error::Internal(format!("cache {} has no member with capacity", cache))
        })
    }

    /// A member leaves `cache` gracefully.
    pub fn handle_leave(&self, cache: &CacheName, leaver: Address) -> Result<()> {
        self.ensure_coordinator()?;
        let published = self.with_status(cache, |status| status.remove_members(&[leaver]))?;
        self.broadcast(cache, published);
        Ok(())
    }

    /// A member finished the phase started by `topology_id`.
    pub fn handle_phase_confirmation(
        &self,
        cache: &CacheName,
        sender: Address,
        topology_id: TopologyId,
        failure: Option<PhaseFailure>,
    ) -> Result<()> {
        self.ensure_coordinator()?;
        debug!(cache = %cache, %sender, topology_id, failed = failure.is_some(), "Phase confirmation");
        let published =
            self.with_status(cache, |status| status.confirm_phase(sender, topology_id, failure))?;
        self.broadcast(cache, published);
        Ok(())
    }

    /// Install a new membership view.
    ///
    /// Returns true if this node just became coordinator, in which case the
    /// caller should run [`recover`](Self::recover).
    pub fn handle_view_change(&self, view: &[Address]) -> bool {
        let was_coordinator = self.is_coordinator();
        *self.view.write() = view.to_vec();
        let is_coordinator = self.is_coordinator();

        if !is_coordinator {
            if was_coordinator {
                info!(coordinator = ?self.coordinator(), "No longer coordinator, dropping cache status");
                self.caches.lock().clear();
            }
            return false;
        }

        let updates: Vec<(CacheName, Vec<CacheTopology>)> = {
            let mut caches = self.caches.lock();
            caches
                .iter_mut()
                .map(|(cache, status)| (cache.clone(), status.on_view_change(view)))
                .collect()
        };
        for (cache, published) in updates {
            self.broadcast(&cache, published);
        }

        if !was_coordinator {
            info!(node = %self.address(), members = ?view, "Became coordinator");
        }
        !was_coordinator
    }

    /// Rebuild cache status from what the members of the view last applied.
    ///
    /// Called once after becoming coordinator. Members that do not answer
    /// within the join timeout are left out.
    pub async fn recover(&self) -> Result<()> {
        self.ensure_coordinator()?;
        let view = self.view.read().clone();
        info!(members = ?view, "Requesting cache status from members");
        let command = Command::new(CommandKind::CacheStatusRequest {
            coordinator: self.address(),
        });
        let options = RpcOptions::default()
            .with_timeout(self.config.join_timeout)
            .with_timeout_as_leaver(true);
        let responses = self
            .rpc
            .invoke_command(&view, command, MapResponseCollector::ignoring_leavers(), options)
            .await?;

        let mut reports: HashMap<CacheName, Vec<(Address, CacheStatusReport)>> = HashMap::new();
        for member in &view {
            match responses.get(member) {
                Some(Response::Success(ResponseValue::CacheStatus(statuses))) => {
                    for report in statuses {
                        reports
                            .entry(report.cache.clone())
                            .or_default()
                            .push((*member, report.clone()));
                    }
                }
                Some(other) => warn!(%member, response = ?other, "Unexpected cache status response"),
                None => debug!(%member, "No cache status from member"),
            }
        }
        for (cache, reports) in reports {
            self.recover_cache(&cache, &reports);
        }
        Ok(())
    }

    /// Seed the status of `cache` from member reports.
    ///
    /// Numbering continues after the highest topology id reported. Members
    /// that joined this coordinator while it was still collecting reports are
    /// added back on top of the recovered status.
    pub fn recover_cache(&self, cache: &CacheName, reports: &[(Address, CacheStatusReport)]) {
        let Some((_, latest)) = reports
            .iter()
            .max_by_key(|(_, report)| report.topology.topology_id)
        else {
            return;
        };
        if !self.is_coordinator() {
            return;
        }
        let view = self.view.read().clone();
        let factor_of = |member: &Address| {
            reports
                .iter()
                .find(|(reporter, _)| reporter == member)
                .map(|(_, report)| report.join_info.capacity_factor)
        };
        let mut members: Vec<(Address, f32)> = latest
            .topology
            .actual_members
            .iter()
            .filter_map(|member| factor_of(member).map(|factor| (*member, factor)))
            .collect();
        for (reporter, report) in reports {
            if !members.iter().any(|(member, _)| member == reporter) {
                members.push((*reporter, report.join_info.capacity_factor));
            }
        }
        members.retain(|(member, _)| view.contains(member));

        let published = {
            let mut caches = self.caches.lock();
            let joined: Vec<(Address, f32)> = match caches.get(cache) {
                Some(existing)
                    if existing
                        .topology()
                        .is_some_and(|t| t.topology_id > latest.topology.topology_id) =>
                {
                    debug!(cache = %cache, "Cache already recovered");
                    return;
                }
                Some(existing) => existing
                    .members()
                    .iter()
                    .map(|member| (*member, existing.capacity_factor(member)))
                    .collect(),
                None => Vec::new(),
            };
            info!(
                cache = %cache,
                topology_id = latest.topology.topology_id,
                reporters = reports.len(),
                "Recovering cache as new coordinator"
            );
            let (mut status, mut published) = ClusterCacheStatus::recover(
                cache.clone(),
                latest.join_info.clone(),
                &latest.topology,
                &members,
                self.is_rebalancing_enabled(),
                Arc::clone(&self.metrics),
            );
            for (member, capacity_factor) in joined {
                published.extend(status.add_member(member, capacity_factor));
            }
            caches.insert(cache.clone(), status);
            published
        };
        self.broadcast(cache, published);
    }

    /// Start a rebalance now, even if rebalancing is disabled.
    pub fn force_rebalance(&self, cache: &CacheName) -> Result<()> {
        self.ensure_coordinator()?;
        info!(cache = %cache, "Forcing rebalance");
        let published = self.with_status(cache, ClusterCacheStatus::force_rebalance)?;
        self.broadcast(cache, published);
        Ok(())
    }

    /// Flip the switch of one cache, or the cluster-wide one with `None`.
    pub fn set_rebalancing_enabled(&self, cache: Option<&CacheName>, enabled: bool) -> Result<()> {
        self.ensure_coordinator()?;
        match cache {
            Some(cache) => {
                info!(cache = %cache, enabled, "Setting cache rebalancing");
                let published =
                    self.with_status(cache, |status| status.set_cache_rebalancing_enabled(enabled))?;
                self.broadcast(cache, published);
            }
            None => {
                info!(enabled, "Setting cluster rebalancing");
                self.rebalancing_enabled.store(enabled, Ordering::Release);
                let updates: Vec<(CacheName, Vec<CacheTopology>)> = {
                    let mut caches = self.caches.lock();
                    caches
                        .iter_mut()
                        .map(|(name, status)| {
                            (name.clone(), status.set_cluster_rebalancing_enabled(enabled))
                        })
                        .collect()
                };
                for (cache, published) in updates {
                    self.broadcast(&cache, published);
                }
            }
        }
        Ok(())
    }

    pub fn rebalancing_status(&self, cache: &CacheName) -> Result<RebalancingStatus> {
        self.ensure_coordinator()?;
        self.with_status(cache, |status| status.rebalancing_status())
    }

    /// Failure that made the last rebalance of `cache` abort, if any.
    pub fn last_rebalance_failure(&self, cache: &CacheName) -> Result<Option<Error>> {
        self.ensure_coordinator()?;
        self.with_status(cache, |status| status.last_failure().cloned())
    }

    /// Progress of the phase awaiting confirmations, if any.
    pub fn phase_diagnostics(&self, cache: &CacheName) -> Result<Option<PhaseDiagnostics>> {
        self.ensure_coordinator()?;
        let grace = self.config.stuck_phase_grace;
        self.with_status(cache, |status| status.diagnostics(grace))
    }

    fn ensure_coordinator(&self) -> Result<()> {
        if self.is_coordinator() {
            Ok(())
        } else {
            Err(Error::NotCoordinator {
                coordinator: self.coordinator(),
            })
        }
    }

    fn with_status<R>(
        &self,
        cache: &CacheName,
        f: impl FnOnce(&mut ClusterCacheStatus) -> R,
    ) -> Result<R> {
        let mut caches = self.caches.lock();
        let status = caches
            .get_mut(cache)
            .ok_or_else(|| Error::CacheNotFound(cache.clone()))?;
        Ok(f(status))
    }

    fn broadcast(&self, cache: &CacheName, published: Vec<CacheTopology>) {
        for topology in published {
            let topology_id = topology.topology_id;
            let requires_confirmation = topology.requires_confirmation();
            let targets = topology.actual_members.clone();
            debug!(
                cache = %cache,
                topology_id,
                phase = %topology.phase,
                targets = ?targets,
                "Broadcasting topology"
            );
            let command = Command::new(CommandKind::TopologyUpdate {
                cache: cache.clone(),
                topology: Box::new(topology),
            });
            if let Err(e) = self
                .rpc
                .send_to_many(&targets, command, DeliverOrder::PerSender)
            {
                warn!(cache = %cache, topology_id, error = %e, "Failed to broadcast topology");
            }
            if requires_confirmation {
                self.schedule_stuck_check(cache.clone(), topology_id);
            }
        }
    }

    fn schedule_stuck_check(&self, cache: CacheName, topology_id: TopologyId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let grace = self.config.stuck_phase_grace;
        let this = self.this.clone();
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(manager) = this.upgrade() {
                manager.check_stuck(&cache, topology_id);
            }
        });
    }

    fn check_stuck(&self, cache: &CacheName, topology_id: TopologyId) {
        let grace = self.config.stuck_phase_grace;
        let missing = self
            .with_status(cache, |status| status.mark_stuck(topology_id, grace))
            .ok()
            .flatten();
        if let Some(missing) = missing {
            warn!(
                cache = %cache,
                topology_id,
                missing = ?missing,
                grace = ?grace,
                "Rebalance phase stuck waiting for confirmations"
            );
        }
    }
}

impl std::fmt::Debug for ClusterTopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTopologyManager")
            .field("address", &self.address())
            .field("coordinator", &self.coordinator())
            .field("caches", &self.caches.lock().len())
            .finish()
    }
}
