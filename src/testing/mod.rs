//! Testing utilities for the coordination core.
//!
//! This module provides tools for testing several members in one process:
//! - An in-memory network with message blocking and crash injection
//! - A recording transport for single-node protocol tests
//! - A map-backed storage collaborator
//! - A cluster fixture and polling helpers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │ CacheNode  │    │ CacheNode  │    │ CacheNode  │            │
//! │   │ + MapStore │    │ + MapStore │    │ + MapStore │            │
//! │   └─────┬──────┘    └─────┬──────┘    └─────┬──────┘            │
//! │         │                 │                 │                   │
//! │         ▼                 ▼                 ▼                   │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │                    InMemoryNetwork                         │ │
//! │  │  - One FIFO inbox per member                               │ │
//! │  │  - Blocked links and killed members drop messages          │ │
//! │  │  - Installs the membership view                            │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use segcast::testing::TestCluster;
//! use segcast::{CacheName, CoreConfig};
//! use std::time::Duration;
//!
//! let cluster = TestCluster::new(3, CoreConfig::default())?;
//! let cache = CacheName::new("users");
//! cluster.start_cache(&cache).await?;
//! cluster.wait_for_stable(&cache, Duration::from_secs(5)).await;
//!
//! cluster.node(1).put(cache.clone(), "k", "v").await?;
//! assert!(cluster.node(3).get(cache, "k").await?.is_some());
//! ```

mod cluster;
mod network;
mod rebalance_e2e_tests;
mod recording;
mod store;

pub use cluster::{wait_for, TestCluster, TestNode};
pub use network::{InMemoryNetwork, InMemoryTransport};
pub use recording::RecordingTransport;
pub use store::MapStore;
