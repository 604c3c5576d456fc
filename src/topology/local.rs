//! Member side of the topology protocol.
//!
//! Topologies are applied strictly in id order: stale ids are rejected, ids
//! beyond `current + 1` are buffered until the gap is filled. Listener
//! callbacks of one cache run one at a time, and a phase confirmation is sent
//! to the coordinator once the callback of a confirmable topology finishes.

use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::rpc::{
    Response, ResponseValue, RpcManager, RpcOptions, SingleResponseCollector, TopologyIdSource,
    VoidResponseCollector,
};
use crate::sequencer::ActionSequencer;
use crate::topology::listener::TopologyListener;
use crate::topology::CacheTopology;
use crate::types::{
    Address, CacheJoinInfo, CacheName, CacheStatusReport, Command, CommandKind, DeliverOrder,
    PhaseFailure, TopologyId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

struct LocalCacheState {
    join_info: CacheJoinInfo,
    listener: Arc<dyn TopologyListener>,
    topology: Option<CacheTopology>,
    /// Topologies received ahead of their predecessors.
    buffered: BTreeMap<TopologyId, CacheTopology>,
    /// Set after reporting to a new coordinator: its next topology may skip
    /// ids this member never saw.
    resync: bool,
    updates: watch::Sender<Option<CacheTopology>>,
}

/// Applies topologies published by the coordinator.
pub struct LocalTopologyManager {
    this: Weak<LocalTopologyManager>,
    rpc: Arc<RpcManager>,
    config: TopologyConfig,
    caches: Mutex<HashMap<CacheName, LocalCacheState>>,
    callbacks: ActionSequencer<CacheName>,
    metrics: Arc<CoreMetrics>,
}

impl LocalTopologyManager {
    pub fn new(rpc: Arc<RpcManager>, config: TopologyConfig, metrics: Arc<CoreMetrics>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            rpc,
            config,
            caches: Mutex::new(HashMap::new()),
            callbacks: ActionSequencer::new(),
            metrics,
        })
    }

    pub fn address(&self) -> Address {
        self.rpc.address()
    }

    /// Join settings derived from the topology config.
    pub fn default_join_info(&self) -> CacheJoinInfo {
        CacheJoinInfo {
            num_owners: self.config.num_owners,
            num_segments: self.config.num_segments,
            capacity_factor: self.config.capacity_factor,
            hash_factory: self.config.hash_factory,
        }
    }

    /// Join `cache` through the coordinator and apply the topology it returns.
    pub async fn join(
        &self,
        cache: &CacheName,
        info: CacheJoinInfo,
        listener: Arc<dyn TopologyListener>,
    ) -> Result<CacheTopology> {
        if let Some(topology) = self.register(cache, info.clone(), listener) {
            debug!(cache = %cache, topology_id = topology.topology_id, "Cache already joined");
            return Ok(topology);
        }

        let coordinator = self.coordinator()?;
        info!(cache = %cache, %coordinator, "Joining cache");
        let command = Command::new(CommandKind::CacheJoin {
            cache: cache.clone(),
            joiner: self.address(),
            info,
        });
        let options = RpcOptions::default().with_timeout(self.config.join_timeout);
        let response = self
            .rpc
            .invoke_command(&[coordinator], command, SingleResponseCollector, options)
            .await;

        match response {
            Ok(Response::Success(ResponseValue::Topology(topology))) => {
                self.handle_topology_update(cache, *topology);
                self.topology(cache)
                    .ok_or_else(|| Error::CacheNotFound(cache.clone()))
            }
            Ok(other) => {
                self.caches.lock().remove(cache);
                Err(Error::Internal(format!(
                    "unexpected join response for {}: {:?}",
                    cache, other
                )))
            }
            Err(e) => {
                warn!(cache = %cache, error = %e, "Join failed");
                self.caches.lock().remove(cache);
                Err(e)
            }
        }
    }

    /// Leave `cache` gracefully.
    pub async fn leave(&self, cache: &CacheName) -> Result<()> {
        if self.caches.lock().remove(cache).is_none() {
            return Err(Error::CacheNotFound(cache.clone()));
        }
        let coordinator = self.coordinator()?;
        info!(cache = %cache, %coordinator, "Leaving cache");
        let command = Command::new(CommandKind::CacheLeave {
            cache: cache.clone(),
            leaver: self.address(),
        });
        let options = RpcOptions::default().with_timeout(self.config.join_timeout);
        self.rpc
            .invoke_command(
                &[coordinator],
                command,
                VoidResponseCollector::ignoring_leavers(),
                options,
            )
            .await
    }

    /// Apply a topology received from the coordinator.
    ///
    /// Returns the number of topologies applied, counting buffered successors
    /// released by this one.
    pub fn handle_topology_update(&self, cache: &CacheName, topology: CacheTopology) -> usize {
        let (applied, listener, first) = {
            let mut caches = self.caches.lock();
            let Some(state) = caches.get_mut(cache) else {
                debug!(cache = %cache, topology_id = topology.topology_id, "Topology for a cache not joined here");
                self.metrics.topology_rejected.inc();
                return 0;
            };

            let current = state.topology.as_ref().map(|t| t.topology_id);
            match current {
                Some(current) if topology.topology_id <= current => {
                    trace!(cache = %cache, topology_id = topology.topology_id, current, "Rejecting stale topology");
                    self.metrics.topology_rejected.inc();
                    return 0;
                }
                Some(current) if topology.topology_id > current + 1 && !state.resync => {
                    debug!(cache = %cache, topology_id = topology.topology_id, current, "Buffering out-of-order topology");
                    self.metrics.topology_buffered.inc();
                    state.buffered.insert(topology.topology_id, topology);
                    return 0;
                }
                _ => {}
            }

            if state.resync {
                debug!(cache = %cache, topology_id = topology.topology_id, ?current, "Resynchronised with new coordinator");
                state.resync = false;
            }
            let mut next_id = topology.topology_id + 1;
            let mut applied = vec![topology];
            while let Some(next) = state.buffered.remove(&next_id) {
                applied.push(next);
                next_id += 1;
            }
            state.buffered = state.buffered.split_off(&next_id);

            let latest = applied.last().cloned();
            state.topology = latest.clone();
            state.updates.send_replace(latest);
            self.metrics.topology_applied.inc_by(applied.len() as u64);
            (applied, Arc::clone(&state.listener), current.is_none())
        };

        let count = applied.len();
        for (i, topology) in applied.into_iter().enumerate() {
            debug!(
                cache = %cache,
                topology_id = topology.topology_id,
                phase = %topology.phase,
                kind = ?topology.kind,
                "Applied topology"
            );
            // The first topology applied may fall in the middle of a phase
            // whose start this member never saw.
            let confirm = topology.requires_confirmation()
                || (first && i == 0 && topology.phase.requires_confirmation());
            self.notify_listener(cache, topology, Arc::clone(&listener), confirm);
        }
        count
    }

    /// Latest applied topology of `cache`.
    pub fn topology(&self, cache: &CacheName) -> Option<CacheTopology> {
        self.caches.lock().get(cache).and_then(|state| state.topology.clone())
    }

    pub fn cache_names(&self) -> Vec<CacheName> {
        self.caches.lock().keys().cloned().collect()
    }

    /// Report every cache with an applied topology to a new coordinator.
    ///
    /// Buffered topologies came from the previous coordinator and are
    /// dropped; the next topology received is applied even if it skips ids.
    pub fn report_status(&self, coordinator: Address) -> Vec<CacheStatusReport> {
        let mut caches = self.caches.lock();
        let reports: Vec<CacheStatusReport> = caches
            .iter_mut()
            .filter_map(|(cache, state)| {
                let topology = state.topology.clone()?;
                state.buffered.clear();
                state.resync = true;
                Some(CacheStatusReport {
                    cache: cache.clone(),
                    join_info: state.join_info.clone(),
                    topology,
                })
            })
            .collect();
        info!(%coordinator, caches = reports.len(), "Reporting cache status");
        reports
    }

    /// Wait until the topology of `cache` satisfies `predicate`.
    pub async fn wait_for_topology<P>(
        &self,
        cache: &CacheName,
        predicate: P,
        timeout: Duration,
    ) -> Result<CacheTopology>
    where
        P: Fn(&CacheTopology) -> bool,
    {
        let mut rx = self
            .caches
            .lock()
            .get(cache)
            .map(|state| state.updates.subscribe())
            .ok_or_else(|| Error::CacheNotFound(cache.clone()))?;

        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|topology| topology.as_ref().is_some_and(&predicate)),
        )
        .await;
        match waited {
            Ok(Ok(topology)) => topology
                .clone()
                .ok_or_else(|| Error::CacheNotFound(cache.clone())),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout {
                request_id: 0,
                missing: Vec::new(),
            }),
        }
    }

    /// Create the local state of `cache`. Returns the applied topology if the
    /// cache was already joined.
    pub(crate) fn register(
        &self,
        cache: &CacheName,
        info: CacheJoinInfo,
        listener: Arc<dyn TopologyListener>,
    ) -> Option<CacheTopology> {
        let mut caches = self.caches.lock();
        if let Some(state) = caches.get(cache) {
            return state.topology.clone();
        }
        let (updates, _) = watch::channel(None);
        caches.insert(
            cache.clone(),
            LocalCacheState {
                join_info: info,
                listener,
                topology: None,
                buffered: BTreeMap::new(),
                resync: false,
                updates,
            },
        );
        None
    }

    fn coordinator(&self) -> Result<Address> {
        self.rpc
            .members()
            .first()
            .copied()
            .ok_or(Error::NotCoordinator { coordinator: None })
    }

    fn notify_listener(
        &self,
        cache: &CacheName,
        topology: CacheTopology,
        listener: Arc<dyn TopologyListener>,
        confirm: bool,
    ) {
        let this = self.this.clone();
        let cache_name = cache.clone();
        let _ = self.callbacks.order_on_key(cache.clone(), move || async move {
            let result = listener.on_topology_update(&cache_name, &topology).await;
            match (confirm, this.upgrade()) {
                (true, Some(manager)) => {
                    manager.confirm_phase(&cache_name, topology.topology_id, result.err())
                }
                _ => {
                    if let Err(failure) = result {
                        warn!(
                            cache = %cache_name,
                            topology_id = topology.topology_id,
                            error = %failure.message,
                            "Topology listener failed"
                        );
                    }
                }
            }
            Ok(())
        });
    }

    fn confirm_phase(&self, cache: &CacheName, topology_id: TopologyId, failure: Option<PhaseFailure>) {
        let coordinator = match self.coordinator() {
            Ok(coordinator) => coordinator,
            Err(_) => return,
        };
        debug!(cache = %cache, topology_id, %coordinator, failed = failure.is_some(), "Confirming phase");
        let command = Command::new(CommandKind::PhaseConfirm {
            cache: cache.clone(),
            sender: self.address(),
            topology_id,
            failure,
        });
        if let Err(e) = self
            .rpc
            .send_to(coordinator, command, DeliverOrder::PerSender)
        {
            warn!(cache = %cache, topology_id, error = %e, "Failed to send phase confirmation");
        }
    }
}

impl TopologyIdSource for LocalTopologyManager {
    fn topology_id(&self, cache: &CacheName) -> Option<TopologyId> {
        self.caches
            .lock()
            .get(cache)
            .and_then(|state| state.topology.as_ref().map(|t| t.topology_id))
    }
}

impl std::fmt::Debug for LocalTopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTopologyManager")
            .field("address", &self.address())
            .field("caches", &self.cache_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HashFactoryKind, RpcConfig};
    use crate::partitioning::{ConsistentHashFactory, DefaultConsistentHashFactory};
    use crate::testing::RecordingTransport;
    use crate::topology::{NoopTopologyListener, Phase, TopologyUpdateKind};

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<TopologyId>>,
        fail_with: Option<PhaseFailure>,
    }

    #[async_trait::async_trait]
    impl TopologyListener for RecordingListener {
        async fn on_topology_update(
            &self,
            _cache: &CacheName,
            topology: &CacheTopology,
        ) -> std::result::Result<(), PhaseFailure> {
            self.seen.lock().push(topology.topology_id);
            match &self.fail_with {
                Some(failure) => Err(failure.clone()),
                None => Ok(()),
            }
        }
    }

    fn setup(local: u64, members: &[u64]) -> (Arc<RecordingTransport>, Arc<LocalTopologyManager>) {
        let transport = RecordingTransport::new(local, members);
        let metrics = Arc::new(CoreMetrics::new());
        let rpc = Arc::new(RpcManager::new(
            transport.clone(),
            RpcConfig::default(),
            Arc::clone(&metrics),
        ));
        (
            transport,
            LocalTopologyManager::new(rpc, TopologyConfig::default(), metrics),
        )
    }

    fn info() -> CacheJoinInfo {
        CacheJoinInfo {
            num_owners: 1,
            num_segments: 8,
            capacity_factor: 1.0,
            hash_factory: HashFactoryKind::Default,
        }
    }

    fn topology(id: TopologyId, phase: Phase, kind: TopologyUpdateKind) -> CacheTopology {
        let members = vec![Address::new(1), Address::new(2)];
        let ch = DefaultConsistentHashFactory::new().create(1, 8, &members, None);
        CacheTopology {
            topology_id: id,
            rebalance_id: 1,
            phase,
            kind,
            current_ch: ch,
            pending_ch: None,
            union_ch: None,
            actual_members: members,
        }
    }

    fn stable(id: TopologyId) -> CacheTopology {
        topology(id, Phase::NoRebalance, TopologyUpdateKind::ChUpdate)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn confirmations(transport: &RecordingTransport) -> Vec<(TopologyId, Option<PhaseFailure>)> {
        transport
            .commands_to(1)
            .into_iter()
            .filter_map(|command| match command.kind {
                CommandKind::PhaseConfirm {
                    topology_id,
                    failure,
                    ..
                } => Some((topology_id, failure)),
                _ => None,
            })
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_out_of_order_updates_applied_in_id_order() {
        let (_transport, manager) = setup(2, &[1, 2]);
        let cache = CacheName::new("c");
        let listener = Arc::new(RecordingListener::default());
        manager.register(&cache, info(), listener.clone());

        assert_eq!(manager.handle_topology_update(&cache, stable(4)), 1);
        assert_eq!(manager.handle_topology_update(&cache, stable(7)), 0);
        assert_eq!(manager.handle_topology_update(&cache, stable(6)), 0);
        assert_eq!(manager.handle_topology_update(&cache, stable(5)), 3);
        assert_eq!(manager.handle_topology_update(&cache, stable(5)), 0);
        settle().await;

        assert_eq!(*listener.seen.lock(), vec![4, 5, 6, 7]);
        assert_eq!(manager.topology_id(&cache), Some(7));
        assert_eq!(manager.metrics.topology_applied.get(), 4);
        assert_eq!(manager.metrics.topology_buffered.get(), 2);
        assert_eq!(manager.metrics.topology_rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_phase_change_confirmed_after_listener() {
        let (transport, manager) = setup(2, &[1, 2]);
        let cache = CacheName::new("c");
        manager.register(&cache, info(), Arc::new(NoopTopologyListener));

        manager.handle_topology_update(&cache, stable(1));
        manager.handle_topology_update(
            &cache,
            topology(2, Phase::ReadOldWriteAll, TopologyUpdateKind::PhaseChange),
        );
        manager.handle_topology_update(
            &cache,
            topology(3, Phase::ReadOldWriteAll, TopologyUpdateKind::ChUpdate),
        );
        settle().await;

        assert_eq!(confirmations(&transport), vec![(2, None)]);
    }

    #[tokio::test]
    async fn test_listener_failure_reported_with_confirmation() {
        let (transport, manager) = setup(2, &[1, 2]);
        let cache = CacheName::new("c");
        let listener = Arc::new(RecordingListener {
            seen: Mutex::new(Vec::new()),
            fail_with: Some(PhaseFailure::fatal("disk full")),
        });
        manager.register(&cache, info(), listener);

        manager.handle_topology_update(
            &cache,
            topology(9, Phase::ReadAllWriteAll, TopologyUpdateKind::PhaseChange),
        );
        settle().await;

        assert_eq!(
            confirmations(&transport),
            vec![(9, Some(PhaseFailure::fatal("disk full")))]
        );
    }

    #[tokio::test]
    async fn test_first_topology_mid_phase_is_confirmed() {
        let (transport, manager) = setup(2, &[1, 2]);
        let cache = CacheName::new("c");
        manager.register(&cache, info(), Arc::new(NoopTopologyListener));

        manager.handle_topology_update(
            &cache,
            topology(5, Phase::ReadNewWriteAll, TopologyUpdateKind::ChUpdate),
        );
        settle().await;

        assert_eq!(confirmations(&transport), vec![(5, None)]);
    }

    #[tokio::test]
    async fn test_join_applies_coordinator_topology() {
        let (transport, manager) = setup(2, &[1, 2]);
        let cache = CacheName::new("c");

        let joining = {
            let manager = Arc::clone(&manager);
            let cache = cache.clone();
            tokio::spawn(async move {
                manager
                    .join(&cache, info(), Arc::new(NoopTopologyListener))
                    .await
            })
        };
        settle().await;

        let (request_id, command) = transport.requests_to(1)[0].clone();
        assert!(matches!(
            command.kind,
            CommandKind::CacheJoin { joiner, .. } if joiner == Address::new(2)
        ));
        manager.rpc.handle_response(
            Address::new(1),
            request_id.unwrap(),
            Response::Success(ResponseValue::Topology(Box::new(stable(3)))),
        );

        let joined = joining.await.unwrap().unwrap();
        assert_eq!(joined.topology_id, 3);
        assert_eq!(manager.report_status(Address::new(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_cache_rejected() {
        let (_transport, manager) = setup(2, &[1, 2]);
        assert_eq!(
            manager.handle_topology_update(&CacheName::new("c"), stable(1)),
            0
        );
        assert!(matches!(
            manager.leave(&CacheName::new("c")).await,
            Err(Error::CacheNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_topology() {
        let (_transport, manager) = setup(2, &[1, 2]);
        let cache = CacheName::new("c");
        manager.register(&cache, info(), Arc::new(NoopTopologyListener));

        let waiter = {
            let manager = Arc::clone(&manager);
            let cache = cache.clone();
            tokio::spawn(async move {
                manager
                    .wait_for_topology(&cache, |t| t.topology_id >= 2, Duration::from_secs(5))
                    .await
            })
        };
        manager.handle_topology_update(&cache, stable(1));
        manager.handle_topology_update(&cache, stable(2));
        assert_eq!(waiter.await.unwrap().unwrap().topology_id, 2);

        let timed_out = manager
            .wait_for_topology(&cache, |t| t.topology_id >= 10, Duration::from_secs(1))
            .await;
        assert!(matches!(timed_out, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_report_status_accepts_next_coordinator_gap() {
        let (_transport, manager) = setup(3, &[1, 2, 3]);
        let cache = CacheName::new("c");
        let listener = Arc::new(RecordingListener::default());
        manager.register(&cache, info(), listener.clone());
        manager.handle_topology_update(&cache, stable(4));
        // Left over from the previous coordinator.
        manager.handle_topology_update(&cache, stable(6));

        let reports = manager.report_status(Address::new(2));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cache, cache);
        assert_eq!(reports[0].topology.topology_id, 4);
        assert_eq!(reports[0].join_info, info());

        assert_eq!(manager.handle_topology_update(&cache, stable(9)), 1);
        assert_eq!(manager.handle_topology_update(&cache, stable(6)), 0);
        // Back to strict ordering once resynchronised.
        assert_eq!(manager.handle_topology_update(&cache, stable(11)), 0);
        assert_eq!(manager.handle_topology_update(&cache, stable(10)), 2);
        settle().await;

        assert_eq!(*listener.seen.lock(), vec![4, 9, 10, 11]);
        assert_eq!(manager.topology_id(&cache), Some(11));
    }
}
