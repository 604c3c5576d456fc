//! Segment ownership: which members own which segments.
//!
//! Keys map to segments through a [`KeyPartitioner`]; segments map to owners
//! through an immutable [`ConsistentHash`] produced by a
//! [`ConsistentHashFactory`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  key "user:123" → xxHash64 → segment 17                      │
//! │                                                              │
//! │  ┌────────────────────── ConsistentHash ─────────────────┐   │
//! │  │  segment 16: node-2 node-3                            │   │
//! │  │  segment 17: node-1 node-2   ← primary first          │   │
//! │  │  segment 18: node-3 node-1                            │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! │                                                              │
//! │  ConsistentHashFactory                                       │
//! │    create / update_members / rebalance / union               │
//! │    ├── DefaultConsistentHashFactory   (balanced, sticky)     │
//! │    ├── SyncConsistentHashFactory      (virtual-node ring)    │
//! │    └── ReplicatedConsistentHashFactory (everyone owns all)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use segcast::partitioning::{ConsistentHashFactory, DefaultConsistentHashFactory, KeyPartitioner};
//! use segcast::types::Address;
//!
//! let factory = DefaultConsistentHashFactory::new();
//! let members = [Address::new(1), Address::new(2), Address::new(3)];
//! let ch = factory.create(2, 64, &members, None);
//!
//! let segment = KeyPartitioner::new(64).segment_of(b"user:123");
//! let owners = ch.locate_owners_for_segment(segment);
//! assert_eq!(owners.len(), 2);
//! ```

mod consistent_hash;
pub(crate) mod factory;
mod hashring;
mod partitioner;
mod replicated;

pub use consistent_hash::ConsistentHash;
pub use factory::{ConsistentHashFactory, DefaultConsistentHashFactory};
pub use hashring::{HashRing, SyncConsistentHashFactory, DEFAULT_VNODES_PER_NODE};
pub use partitioner::{hash_key, KeyPartitioner};
pub use replicated::ReplicatedConsistentHashFactory;
