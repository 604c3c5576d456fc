//! Multi-node cluster fixture on top of [`InMemoryNetwork`].

use crate::config::CoreConfig;
use crate::error::Result;
use crate::node::CacheNode;
use crate::testing::network::InMemoryNetwork;
use crate::testing::store::MapStore;
use crate::topology::{CacheTopology, NoopTopologyListener, Phase, RebalancingStatus};
use crate::types::{Address, CacheName, NodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One node of a [`TestCluster`] with its store.
pub struct TestNode {
    pub node: Arc<CacheNode>,
    pub store: Arc<MapStore>,
}

/// A cluster of [`CacheNode`]s sharing one in-memory network.
///
/// Node ids start at 1; the first live node is the coordinator.
pub struct TestCluster {
    pub network: InMemoryNetwork,
    nodes: Vec<TestNode>,
    config: CoreConfig,
    next_id: NodeId,
}

impl TestCluster {
    /// Start `count` nodes. Must be called from within a tokio runtime.
    pub fn new(count: usize, config: CoreConfig) -> Result<Self> {
        let network = InMemoryNetwork::new();
        let addresses: Vec<Address> = (1..=count as NodeId).map(Address::new).collect();
        network.install_view(&addresses);

        let mut cluster = Self {
            network,
            nodes: Vec::with_capacity(count),
            config,
            next_id: count as NodeId + 1,
        };
        for address in addresses {
            cluster.spawn_node(address)?;
        }
        Ok(cluster)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.nodes.iter().map(|n| n.node.address()).collect()
    }

    /// Node with id `id`. Panics if it is not part of the cluster.
    pub fn node(&self, id: NodeId) -> &Arc<CacheNode> {
        &self.entry(id).node
    }

    pub fn store(&self, id: NodeId) -> &Arc<MapStore> {
        &self.entry(id).store
    }

    pub fn coordinator(&self) -> &Arc<CacheNode> {
        &self.nodes[0].node
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<CacheNode>> {
        self.nodes.iter().map(|n| &n.node)
    }

    /// Start `cache` on every node, one after the other.
    pub async fn start_cache(&self, cache: &CacheName) -> Result<()> {
        for entry in &self.nodes {
            entry
                .node
                .start_cache(cache.clone(), Arc::new(NoopTopologyListener))
                .await?;
        }
        Ok(())
    }

    /// Add a node and install the grown view everywhere.
    pub fn add_node(&mut self) -> Result<Arc<CacheNode>> {
        let address = Address::new(self.next_id);
        self.next_id += 1;
        let mut view = self.addresses();
        view.push(address);
        self.network.install_view(&view);
        let node = self.spawn_node(address)?;
        self.propagate_view();
        Ok(node)
    }

    /// Crash node `id` and install the shrunk view on the survivors.
    pub fn kill(&mut self, id: NodeId) {
        let address = Address::new(id);
        self.network.kill(address);
        self.nodes.retain(|n| n.node.address() != address);
        self.network.install_view(&self.addresses());
        self.propagate_view();
    }

    /// Whether every node applied the coordinator's latest topology and no
    /// rebalance is running or pending.
    pub fn is_stable(&self, cache: &CacheName) -> bool {
        let coordinator = self.coordinator();
        if coordinator.rebalancing_status(cache).ok() != Some(RebalancingStatus::Complete) {
            return false;
        }
        let Some(latest) = coordinator.cluster_topology().cache_topology(cache) else {
            return false;
        };
        latest.phase == Phase::NoRebalance
            && latest.actual_members == self.addresses()
            && self.nodes().all(|node| {
                node.topology(cache)
                    .is_some_and(|t| t.topology_id == latest.topology_id)
            })
    }

    /// Wait until [`is_stable`](Self::is_stable) holds, returning the stable
    /// topology.
    pub async fn wait_for_stable(&self, cache: &CacheName, timeout: Duration) -> Option<CacheTopology> {
        if wait_for(|| self.is_stable(cache), timeout).await {
            self.coordinator().topology(cache)
        } else {
            None
        }
    }

    fn entry(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.node.address() == Address::new(id))
            .unwrap_or_else(|| panic!("node {} is not part of the cluster", id))
    }

    fn spawn_node(&mut self, address: Address) -> Result<Arc<CacheNode>> {
        let transport = self.network.transport(address);
        let store = Arc::new(MapStore::new());
        let node = CacheNode::new(transport, self.config.clone(), store.clone())?;
        self.network.attach(address, node.clone());
        self.nodes.push(TestNode {
            node: Arc::clone(&node),
            store,
        });
        Ok(node)
    }

    fn propagate_view(&self) {
        let view = self.network.view();
        for node in self.nodes() {
            node.on_view_change(&view);
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
