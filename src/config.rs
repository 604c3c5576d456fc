//! Configuration types for the coordination core.

use crate::error::{Error, Result};
use crate::partitioning::{
    ConsistentHashFactory, DefaultConsistentHashFactory, ReplicatedConsistentHashFactory,
    SyncConsistentHashFactory,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration for a node.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// RPC layer configuration.
    pub rpc: RpcConfig,

    /// Topology and rebalance configuration.
    pub topology: TopologyConfig,
}

impl CoreConfig {
    /// Set RPC configuration.
    pub fn with_rpc_config(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    /// Set topology configuration.
    pub fn with_topology_config(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    /// Reject settings the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.rpc.validate()?;
        self.topology.validate()
    }
}

/// RPC request/response configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Deadline for a request to reach a terminal state.
    pub timeout: Duration,

    /// Delay before contacting the next target of a staggered request.
    /// None means `timeout / 10`.
    pub stagger_delay: Option<Duration>,

    /// Feed leaver responses for missing targets on timeout instead of failing.
    pub timeout_as_leaver: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stagger_delay: None,
            timeout_as_leaver: false,
        }
    }
}

impl RpcConfig {
    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the staggered request delay.
    pub fn with_stagger_delay(mut self, delay: Duration) -> Self {
        self.stagger_delay = Some(delay);
        self
    }

    /// Treat timed out targets as leavers.
    pub fn with_timeout_as_leaver(mut self, enabled: bool) -> Self {
        self.timeout_as_leaver = enabled;
        self
    }

    /// Effective staggered request delay.
    pub fn effective_stagger_delay(&self) -> Duration {
        self.stagger_delay.unwrap_or(self.timeout / 10)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::Config("rpc timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Segment placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashFactoryKind {
    /// Capacity-weighted balanced placement that keeps owners where possible.
    Default,
    /// Placement derived from a virtual-node hash ring.
    Sync,
    /// Every member owns every segment.
    Replicated,
}

impl HashFactoryKind {
    /// Build the factory for this kind.
    pub fn build(&self) -> Arc<dyn ConsistentHashFactory> {
        match self {
            HashFactoryKind::Default => Arc::new(DefaultConsistentHashFactory::new()),
            HashFactoryKind::Sync => Arc::new(SyncConsistentHashFactory::new()),
            HashFactoryKind::Replicated => Arc::new(ReplicatedConsistentHashFactory::new()),
        }
    }
}

/// Topology and rebalance configuration.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Number of owners per segment.
    pub num_owners: usize,

    /// Number of segments.
    pub num_segments: usize,

    /// Placement strategy.
    pub hash_factory: HashFactoryKind,

    /// Relative capacity of this node. Zero means the node owns nothing.
    pub capacity_factor: f32,

    /// Whether rebalancing starts automatically on membership changes.
    pub rebalancing_enabled: bool,

    /// How long a phase may wait for confirmations before it is reported stuck.
    pub stuck_phase_grace: Duration,

    /// How long a member waits for the coordinator to answer a join.
    pub join_timeout: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            num_owners: 2,
            num_segments: 256,
            hash_factory: HashFactoryKind::Default,
            capacity_factor: 1.0,
            rebalancing_enabled: true,
            stuck_phase_grace: Duration::from_secs(60),
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl TopologyConfig {
    /// Set the number of owners.
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    /// Set the number of segments.
    pub fn with_num_segments(mut self, num_segments: usize) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Set the placement strategy.
    pub fn with_hash_factory(mut self, kind: HashFactoryKind) -> Self {
        self.hash_factory = kind;
        self
    }

    /// Set this node's capacity factor.
    pub fn with_capacity_factor(mut self, capacity_factor: f32) -> Self {
        self.capacity_factor = capacity_factor;
        self
    }

    /// Enable or disable automatic rebalancing.
    pub fn with_rebalancing_enabled(mut self, enabled: bool) -> Self {
        self.rebalancing_enabled = enabled;
        self
    }

    /// Set the stuck-phase grace period.
    pub fn with_stuck_phase_grace(mut self, grace: Duration) -> Self {
        self.stuck_phase_grace = grace;
        self
    }

    /// Set the join timeout.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be at least 1".into()));
        }
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be at least 1".into()));
        }
        if !self.capacity_factor.is_finite() || self.capacity_factor < 0.0 {
            return Err(Error::Config(format!(
                "capacity_factor must be a non-negative number, got {}",
                self.capacity_factor
            )));
        }
        if self.join_timeout.is_zero() {
            return Err(Error::Config("join_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
