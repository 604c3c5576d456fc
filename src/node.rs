//! A cluster member hosting clustered caches.
//!
//! `CacheNode` wires the RPC layer, the coordinator and member topology
//! managers and the action sequencer together, and dispatches inbound commands
//! with a single `match` on [`CommandKind`]. Data commands are handed to a
//! [`CommandHandler`] owned by the storage layer; writes to one key run in
//! the order they arrived.

use crate::cluster::{ClusterMembership, LoggingEventListener};
use crate::config::CoreConfig;
use crate::error::{Error, RemoteError, Result};
use crate::metrics::CoreMetrics;
use crate::partitioning::KeyPartitioner;
use crate::rpc::{
    FirstSuccessCollector, InboundHandler, InvocationCounter, MapResponseCollector, Response,
    ResponseValue, RpcManager, RpcMessage, RpcOptions, TopologyIdInterceptor, TopologyIdSource,
    Transport,
};
use crate::sequencer::{ActionSequencer, SequencerStats};
use crate::topology::{
    CacheTopology, ClusterTopologyManager, DependencyGraph, LocalTopologyManager,
    PhaseDiagnostics, RebalancingStatus, TopologyListener,
};
use crate::types::{Address, CacheName, Command, CommandKind, DeliverOrder};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Storage collaborator executing data commands on this member.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute a data command received from `origin`.
    async fn handle(&self, origin: Address, command: Command) -> Result<Response>;
}

/// One member of the cluster.
pub struct CacheNode {
    this: Weak<CacheNode>,
    rpc: Arc<RpcManager>,
    membership: ClusterMembership,
    cluster: Arc<ClusterTopologyManager>,
    local: Arc<LocalTopologyManager>,
    sequencer: ActionSequencer<(CacheName, Bytes)>,
    /// Orders writes received as an owner, in arrival order.
    owner_writes: ActionSequencer<(CacheName, Bytes)>,
    handler: Arc<dyn CommandHandler>,
    dependencies: Mutex<DependencyGraph<CacheName>>,
    invocations: Arc<InvocationCounter>,
    metrics: Arc<CoreMetrics>,
}

impl CacheNode {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: CoreConfig,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(CoreMetrics::new());
        let rpc = Arc::new(RpcManager::new(
            transport,
            config.rpc.clone(),
            Arc::clone(&metrics),
        ));
        let cluster = ClusterTopologyManager::new(
            Arc::clone(&rpc),
            config.topology.clone(),
            Arc::clone(&metrics),
        );
        let local = LocalTopologyManager::new(
            Arc::clone(&rpc),
            config.topology.clone(),
            Arc::clone(&metrics),
        );

        let source: Arc<dyn TopologyIdSource> = local.clone();
        rpc.add_interceptor(Arc::new(TopologyIdInterceptor::new(Arc::downgrade(&source))));
        let invocations = Arc::new(InvocationCounter::new());
        rpc.add_interceptor(invocations.clone());

        let membership = ClusterMembership::new(rpc.address());
        membership.add_listener(Arc::new(LoggingEventListener));
        membership.install(&rpc.members());

        info!(node = %rpc.address(), "Cache node created");
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            rpc,
            membership,
            cluster,
            local,
            sequencer: ActionSequencer::with_metrics(Arc::clone(&metrics)),
            owner_writes: ActionSequencer::new(),
            handler,
            dependencies: Mutex::new(DependencyGraph::new()),
            invocations,
            metrics,
        }))
    }

    pub fn address(&self) -> Address {
        self.rpc.address()
    }

    pub fn rpc(&self) -> &Arc<RpcManager> {
        &self.rpc
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.metrics
    }

    /// Outbound invocations per command kind.
    pub fn invocations(&self) -> &Arc<InvocationCounter> {
        &self.invocations
    }

    pub fn local_topology(&self) -> &Arc<LocalTopologyManager> {
        &self.local
    }

    pub fn cluster_topology(&self) -> &Arc<ClusterTopologyManager> {
        &self.cluster
    }

    pub fn is_coordinator(&self) -> bool {
        self.cluster.is_coordinator()
    }

    pub fn sequencer_stats(&self) -> SequencerStats {
        self.sequencer.stats()
    }

    /// Latest topology applied locally for `cache`.
    pub fn topology(&self, cache: &CacheName) -> Option<CacheTopology> {
        self.local.topology(cache)
    }

    /// Join `cache` and wait for the coordinator's topology.
    pub async fn start_cache(
        &self,
        cache: impl Into<CacheName>,
        listener: Arc<dyn TopologyListener>,
    ) -> Result<CacheTopology> {
        let cache = cache.into();
        self.dependencies.lock().add(cache.clone());
        let info = self.local.default_join_info();
        let topology = self.local.join(&cache, info, listener).await?;
        info!(cache = %cache, topology_id = topology.topology_id, "Cache started");
        Ok(topology)
    }

    /// Record that `dependant` must stop before `dependency`.
    pub fn add_cache_dependency(
        &self,
        dependant: impl Into<CacheName>,
        dependency: impl Into<CacheName>,
    ) -> Result<()> {
        self.dependencies
            .lock()
            .add_dependency(dependant.into(), dependency.into())
    }

    /// Leave `cache`, after every cache depending on it.
    pub async fn stop_cache(&self, cache: impl Into<CacheName>) -> Result<()> {
        let cache = cache.into();
        let order = {
            let graph = self.dependencies.lock();
            let mut affected = HashSet::from([cache.clone()]);
            let mut frontier = vec![cache.clone()];
            while let Some(next) = frontier.pop() {
                for dependant in graph.dependants_of(&next) {
                    if affected.insert(dependant.clone()) {
                        frontier.push(dependant);
                    }
                }
            }
            let mut order = graph.topological_order();
            order.retain(|name| affected.contains(name));
            order.reverse();
            order
        };

        for name in order {
            self.stop_one(&name).await?;
        }
        Ok(())
    }

    /// Leave every cache, dependants first.
    pub async fn stop(&self) -> Result<()> {
        let mut order = self.dependencies.lock().topological_order();
        order.reverse();
        for name in order {
            self.stop_one(&name).await?;
        }
        Ok(())
    }

    /// Read `key` from the read owners of its segment, local owner first.
    pub async fn get(&self, cache: impl Into<CacheName>, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let cache = cache.into();
        let key = key.into();
        let topology = self
            .local
            .topology(&cache)
            .ok_or_else(|| Error::CacheNotFound(cache.clone()))?;
        let segment = KeyPartitioner::new(topology.num_segments()).segment_of(&key);
        let mut owners = topology.read_owners(segment).to_vec();
        let local = self.address();
        if let Some(pos) = owners.iter().position(|owner| *owner == local) {
            owners.swap(0, pos);
        }
        trace!(cache = %cache, segment, owners = ?owners, "Reading key");

        let command = Command::get(cache, key).with_topology_id(topology.topology_id);
        let value = self
            .rpc
            .invoke_command_staggered(
                &owners,
                command,
                FirstSuccessCollector::new(),
                RpcOptions::default(),
            )
            .await?;
        match value {
            ResponseValue::Value(value) => Ok(value),
            ResponseValue::Empty => Ok(None),
            ResponseValue::Topology(_) | ResponseValue::CacheStatus(_) => {
                Err(Error::Internal("unexpected control payload in read response".into()))
            }
        }
    }

    /// Write `key`, ordered after earlier writes of the same key issued here.
    /// Returns the previous value.
    pub async fn put(
        &self,
        cache: impl Into<CacheName>,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Option<Bytes>> {
        let cache = cache.into();
        let key = key.into();
        let command = Command::put(cache.clone(), key.clone(), value);
        self.ordered_write(cache, key, command).await
    }

    /// Remove `key`. Returns the previous value.
    pub async fn remove(&self, cache: impl Into<CacheName>, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let cache = cache.into();
        let key = key.into();
        let command = Command::remove(cache.clone(), key.clone());
        self.ordered_write(cache, key, command).await
    }

    /// Install a membership view supplied by the group-membership service.
    pub fn on_view_change(&self, members: &[Address]) {
        let Some(events) = self.membership.install(members) else {
            return;
        };
        debug!(node = %self.address(), events = events.len(), "View changed");
        self.rpc.on_view_change(members);
        if self.cluster.handle_view_change(members) {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!(node = %self.address(), "No runtime to recover cache status on");
                return;
            };
            let cluster = Arc::clone(&self.cluster);
            handle.spawn(async move {
                if let Err(e) = cluster.recover().await {
                    warn!(error = %e, "Cache status recovery failed");
                }
            });
        }
    }

    pub fn force_rebalance(&self, cache: &CacheName) -> Result<()> {
        self.cluster.force_rebalance(cache)
    }

    pub fn set_rebalancing_enabled(&self, cache: Option<&CacheName>, enabled: bool) -> Result<()> {
        self.cluster.set_rebalancing_enabled(cache, enabled)
    }

    pub fn rebalancing_status(&self, cache: &CacheName) -> Result<RebalancingStatus> {
        self.cluster.rebalancing_status(cache)
    }

    pub fn last_rebalance_failure(&self, cache: &CacheName) -> Result<Option<Error>> {
        self.cluster.last_rebalance_failure(cache)
    }

    pub fn phase_diagnostics(&self, cache: &CacheName) -> Result<Option<PhaseDiagnostics>> {
        self.cluster.phase_diagnostics(cache)
    }

    async fn stop_one(&self, cache: &CacheName) -> Result<()> {
        match self.local.leave(cache).await {
            Ok(()) | Err(Error::CacheNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.dependencies.lock().remove(cache);
        info!(cache = %cache, "Cache stopped");
        Ok(())
    }

    async fn ordered_write(&self, cache: CacheName, key: Bytes, command: Command) -> Result<Option<Bytes>> {
        let rpc = Arc::clone(&self.rpc);
        let local = Arc::clone(&self.local);
        self.sequencer
            .order_on_key((cache.clone(), key.clone()), move || async move {
                let topology = local
                    .topology(&cache)
                    .ok_or_else(|| Error::CacheNotFound(cache.clone()))?;
                let segment = KeyPartitioner::new(topology.num_segments()).segment_of(&key);
                let owners = topology.write_owners(segment).to_vec();
                trace!(cache = %cache, segment, owners = ?owners, "Writing key");

                // Owners apply writes in arrival order; total order makes
                // that order the same on every owner.
                let command = command.with_topology_id(topology.topology_id);
                let responses = rpc
                    .invoke_command(
                        &owners,
                        command,
                        MapResponseCollector::ignoring_leavers(),
                        RpcOptions::default().with_deliver_order(DeliverOrder::Total),
                    )
                    .await?;
                let previous = owners.iter().find_map(|owner| match responses.get(owner) {
                    Some(Response::Success(ResponseValue::Value(value))) => Some(value.clone()),
                    _ => None,
                });
                Ok(previous.flatten())
            })
            .await
    }

    fn dispatch_control(&self, kind: CommandKind) -> Result<Response> {
        match kind {
            CommandKind::CacheJoin {
                cache,
                joiner,
                info,
            } => self
                .cluster
                .handle_join(&cache, joiner, info)
                .map(|topology| Response::Success(ResponseValue::Topology(Box::new(topology)))),
            CommandKind::CacheLeave { cache, leaver } => self
                .cluster
                .handle_leave(&cache, leaver)
                .map(|()| Response::empty()),
            CommandKind::TopologyUpdate { cache, topology } => {
                self.local.handle_topology_update(&cache, *topology);
                Ok(Response::empty())
            }
            CommandKind::PhaseConfirm {
                cache,
                sender,
                topology_id,
                failure,
            } => self
                .cluster
                .handle_phase_confirmation(&cache, sender, topology_id, failure)
                .map(|()| Response::empty()),
            CommandKind::CacheStatusRequest { coordinator } => Ok(Response::Success(
                ResponseValue::CacheStatus(self.local.report_status(coordinator)),
            )),
            CommandKind::Get { .. }
            | CommandKind::Put { .. }
            | CommandKind::Remove { .. }
            | CommandKind::Opaque { .. } => Err(Error::Internal("data command on control path".into())),
        }
    }

    fn reply(&self, origin: Address, request_id: Option<u64>, result: Result<Response>) {
        let response = result.unwrap_or_else(|e| {
            let mut remote = RemoteError::from(&e);
            remote.origin.get_or_insert(self.address());
            Response::Exception(remote)
        });
        if let Some(request_id) = request_id {
            if let Err(e) = self.rpc.reply(origin, request_id, response) {
                warn!(%origin, request_id, error = %e, "Failed to send reply");
            }
        }
    }
}

impl InboundHandler for CacheNode {
    fn handle(&self, origin: Address, message: RpcMessage) {
        let (request_id, command) = match message {
            RpcMessage::Response {
                request_id,
                response,
            } => {
                self.rpc.handle_response(origin, request_id, response);
                return;
            }
            RpcMessage::Request {
                request_id,
                command,
            } => (request_id, command),
        };

        if !command.is_data_command() {
            let result = self.dispatch_control(command.kind);
            self.reply(origin, request_id, result);
            return;
        }

        let Some(node) = self.this.upgrade() else {
            return;
        };
        let written = command
            .written_key()
            .map(|(cache, key)| (cache.clone(), key.clone()));
        if let Some(key) = written {
            let _ = self.owner_writes.order_on_key(key, move || async move {
                let result = node.handler.handle(origin, command).await;
                node.reply(origin, request_id, result);
                Ok(())
            });
            return;
        }
        tokio::spawn(async move {
            let result = node.handler.handle(origin, command).await;
            node.reply(origin, request_id, result);
        });
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("address", &self.address())
            .field("view", &self.membership.view())
            .finish()
    }
}
