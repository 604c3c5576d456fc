//! Cluster coordination core for a partitioned, replicated key-value cache.
//!
//! This crate provides the pieces a clustered cache needs to agree on who
//! owns what and to talk to the owners:
//! - **Consistent hash factories** mapping segments to ordered owner lists
//! - **Phased rebalancing** driven by a coordinator with per-phase confirmation
//! - **An action sequencer** running asynchronous actions in per-key order
//! - **A fire-and-collect RPC layer** with pluggable response collectors
//!
//! # Example
//!
//! ```rust,ignore
//! use segcast::{CacheNode, CoreConfig, NoopTopologyListener};
//! use std::sync::Arc;
//!
//! // `transport` connects this member to the group; `store` executes data
//! // commands on behalf of this member.
//! let node = CacheNode::new(transport, CoreConfig::default(), store)?;
//! node.start_cache("users", Arc::new(NoopTopologyListener)).await?;
//!
//! // Writes go to every write owner of the key's segment
//! node.put("users", "user:123", "Alice").await?;
//!
//! // Reads try the read owners one after the other, local owner first
//! let value = node.get("users", "user:123").await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 CacheNode                   │
//! │  • start_cache / stop_cache                 │
//! │  • get / put / remove                       │
//! │  • on_view_change                           │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼────────────────┬──────────────┐
//!     ▼               ▼                ▼              ▼
//! ┌─────────┐   ┌───────────┐   ┌────────────┐   ┌──────────┐
//! │ Cluster │   │ Topology  │   │  Action    │   │   RPC    │
//! │  views  │   │ managers  │   │ sequencer  │   │ manager  │
//! └─────────┘   └───────────┘   └────────────┘   └──────────┘
//!                     │                               │
//!                     ▼                               ▼
//!              ┌─────────────┐                 ┌─────────────┐
//!              │ Consistent  │                 │  Transport  │
//!              │   hashes    │                 │             │
//!              └─────────────┘                 └─────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Topologies**: every cache topology has a strictly increasing id and
//!   members apply them in id order
//! - **Writes**: ordered per key on the issuing member, and applied by every
//!   owner in one total order
//! - **Reads**: served by the read owners of the current phase

pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod partitioning;
pub mod rpc;
pub mod sequencer;
pub mod testing;
pub mod topology;
pub mod types;

// Re-exports for convenience
pub use config::{CoreConfig, HashFactoryKind, RpcConfig, TopologyConfig};
pub use error::{Error, RemoteError, Result};
pub use node::{CacheNode, CommandHandler};
pub use types::{
    Address, CacheJoinInfo, CacheName, CacheStatusReport, Command, CommandKind, DeliverOrder,
    NodeId, PhaseFailure, Segment, TopologyId,
};

// Cluster membership
pub use cluster::{ClusterMembership, MemberEvent, MemberEventListener, MembershipView};

// Partitioning
pub use partitioning::{
    ConsistentHash, ConsistentHashFactory, DefaultConsistentHashFactory, KeyPartitioner,
    ReplicatedConsistentHashFactory, SyncConsistentHashFactory,
};

// Topology
pub use topology::{
    CacheTopology, ClusterTopologyManager, LocalTopologyManager, NoopTopologyListener, Phase,
    RebalancingStatus, TopologyListener,
};

// Sequencing
pub use sequencer::{ActionHandle, ActionSequencer, SequencerStats};

// RPC
pub use rpc::{
    InboundHandler, Response, ResponseCollector, ResponseValue, RpcManager, RpcMessage,
    RpcOptions, Transport,
};

// Metrics
pub use metrics::{CoreMetrics, MetricsSnapshot};
