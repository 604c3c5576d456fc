//! Cache topologies and the phased rebalance protocol.
//!
//! # Protocol
//!
//! ```text
//!   coordinator (view[0])                          every member
//!  ┌──────────────────────────┐  TopologyUpdate  ┌─────────────────────────┐
//!  │ ClusterTopologyManager   │ ───────────────► │ LocalTopologyManager    │
//!  │   ClusterCacheStatus     │                  │   apply in id order     │
//!  │   per cache              │ ◄─────────────── │   TopologyListener      │
//!  └──────────────────────────┘   PhaseConfirm   └─────────────────────────┘
//! ```
//!
//! A membership change makes the coordinator compute a pending hash and walk
//! the cache through `ReadOldWriteAll`, `ReadAllWriteAll`, `ReadNewWriteAll`
//! and `Transitory` back to `NoRebalance`. Each phase is published as a new
//! [`CacheTopology`] and advances only once every member confirmed it.
//! Leavers count as confirmed; joiners are expected from the next phase on.

mod cache_topology;
mod cluster;
mod graph;
mod listener;
mod local;
mod status;

pub use cache_topology::{CacheTopology, Phase, TopologyUpdateKind};
pub use cluster::ClusterTopologyManager;
pub use graph::DependencyGraph;
pub use listener::{NoopTopologyListener, TopologyListener};
pub use local::LocalTopologyManager;
pub use status::{ClusterCacheStatus, PhaseDiagnostics, RebalancingStatus};
