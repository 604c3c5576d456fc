//! Core types used throughout the coordination core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::topology::CacheTopology;

/// Numeric identity of a cluster node.
pub type NodeId = u64;

/// Version number of a cache topology. Strictly increasing per cache.
pub type TopologyId = u64;

/// Index of a segment in a consistent hash.
pub type Segment = usize;

/// Opaque, comparable node identity within a membership view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(NodeId);

impl Address {
    /// Create an address from a node id.
    pub const fn new(id: NodeId) -> Self {
        Self(id)
    }

    /// The node id behind this address.
    pub fn id(&self) -> NodeId {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<NodeId> for Address {
    fn from(id: NodeId) -> Self {
        Self(id)
    }
}

/// Name of a clustered cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheName(Arc<str>);

impl CacheName {
    /// Create a cache name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Delivery order hint passed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliverOrder {
    /// No ordering guarantee.
    None,
    /// Messages from one sender are delivered in send order.
    PerSender,
    /// Every target of a multicast delivers it in the same position
    /// relative to other `Total` multicasts.
    Total,
}

/// Hash settings a member announces when joining a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheJoinInfo {
    /// Requested number of owners per segment.
    pub num_owners: usize,
    /// Number of segments.
    pub num_segments: usize,
    /// Relative capacity of the joining member.
    pub capacity_factor: f32,
    /// Which placement strategy the cache uses.
    pub hash_factory: crate::config::HashFactoryKind,
}

/// Outcome of a member's work for a rebalance phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseFailure {
    /// Human readable description.
    pub message: String,
    /// Whether the failure invalidates the whole rebalance.
    pub fatal: bool,
}

impl PhaseFailure {
    /// A failure the coordinator logs and tolerates.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// A failure that aborts the in-flight rebalance.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// A command dispatched to one or more members.
///
/// The topology id is stamped before dispatch when it is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Topology the sender was using, if known.
    pub topology_id: Option<TopologyId>,
    /// What the command does.
    pub kind: CommandKind,
}

/// Command families, dispatched through a single `match` on the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Read a key.
    Get { cache: CacheName, key: Bytes },

    /// Write a key, returning the previous value.
    Put {
        cache: CacheName,
        key: Bytes,
        value: Bytes,
    },

    /// Remove a key, returning the previous value.
    Remove { cache: CacheName, key: Bytes },

    /// Member asks the coordinator to join a cache.
    CacheJoin {
        cache: CacheName,
        joiner: Address,
        info: CacheJoinInfo,
    },

    /// Member leaves a cache gracefully.
    CacheLeave { cache: CacheName, leaver: Address },

    /// Coordinator publishes a new topology.
    TopologyUpdate {
        cache: CacheName,
        topology: Box<CacheTopology>,
    },

    /// Member confirms it finished the work for a rebalance phase.
    PhaseConfirm {
        cache: CacheName,
        sender: Address,
        topology_id: TopologyId,
        failure: Option<PhaseFailure>,
    },

    /// A new coordinator asks a member for the caches it runs.
    CacheStatusRequest { coordinator: Address },

    /// Payload interpreted entirely by the storage collaborator.
    Opaque { cache: CacheName, payload: Bytes },
}

/// What a member reports about one cache to a recovering coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatusReport {
    pub cache: CacheName,
    pub join_info: CacheJoinInfo,
    /// Last topology the member applied.
    pub topology: CacheTopology,
}

impl Command {
    /// Wrap a command kind without a topology id.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            topology_id: None,
            kind,
        }
    }

    /// Create a Get command.
    pub fn get(cache: impl Into<CacheName>, key: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::Get {
            cache: cache.into(),
            key: key.into(),
        })
    }

    /// Create a Put command.
    pub fn put(
        cache: impl Into<CacheName>,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(CommandKind::Put {
            cache: cache.into(),
            key: key.into(),
            value: value.into(),
        })
    }

    /// Create a Remove command.
    pub fn remove(cache: impl Into<CacheName>, key: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::Remove {
            cache: cache.into(),
            key: key.into(),
        })
    }

    /// Set the topology id.
    pub fn with_topology_id(mut self, topology_id: TopologyId) -> Self {
        self.topology_id = Some(topology_id);
        self
    }

    /// The cache this command targets, if it targets one.
    pub fn cache(&self) -> Option<&CacheName> {
        match &self.kind {
            CommandKind::Get { cache, .. }
            | CommandKind::Put { cache, .. }
            | CommandKind::Remove { cache, .. }
            | CommandKind::CacheJoin { cache, .. }
            | CommandKind::CacheLeave { cache, .. }
            | CommandKind::TopologyUpdate { cache, .. }
            | CommandKind::PhaseConfirm { cache, .. }
            | CommandKind::Opaque { cache, .. } => Some(cache),
            CommandKind::CacheStatusRequest { .. } => None,
        }
    }

    /// Short name of the command kind, used for logging and counting.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            CommandKind::Get { .. } => "get",
            CommandKind::Put { .. } => "put",
            CommandKind::Remove { .. } => "remove",
            CommandKind::CacheJoin { .. } => "cache_join",
            CommandKind::CacheLeave { .. } => "cache_leave",
            CommandKind::TopologyUpdate { .. } => "topology_update",
            CommandKind::PhaseConfirm { .. } => "phase_confirm",
            CommandKind::CacheStatusRequest { .. } => "cache_status_request",
            CommandKind::Opaque { .. } => "opaque",
        }
    }

    /// Cache and key a write command modifies.
    pub fn written_key(&self) -> Option<(&CacheName, &Bytes)> {
        match &self.kind {
            CommandKind::Put { cache, key, .. } | CommandKind::Remove { cache, key } => {
                Some((cache, key))
            }
            _ => None,
        }
    }

    /// Whether the command only reads data.
    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, CommandKind::Get { .. })
    }

    /// Whether the command carries data subject to topology checks.
    pub fn is_data_command(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Get { .. }
                | CommandKind::Put { .. }
                | CommandKind::Remove { .. }
                | CommandKind::Opaque { .. }
        )
    }
}
