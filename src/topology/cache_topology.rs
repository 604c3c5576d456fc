//! Versioned snapshot of a cache's data placement.

use crate::partitioning::ConsistentHash;
use crate::types::{Address, Segment, TopologyId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Rebalance phase of a cache.
///
/// ```text
/// NoRebalance ─► ReadOldWriteAll ─► ReadAllWriteAll ─► ReadNewWriteAll ─► Transitory ─► NoRebalance
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Stable: only the current hash exists.
    NoRebalance,
    /// Reads use the current hash, writes go to both hashes.
    ReadOldWriteAll,
    /// Reads and writes use both hashes.
    ReadAllWriteAll,
    /// Reads use the pending hash, writes go to both hashes.
    ReadNewWriteAll,
    /// Pending hash promoted; old owners may drop what they no longer own.
    Transitory,
}

impl Phase {
    /// Whether every member must confirm this phase before the next starts.
    pub fn requires_confirmation(&self) -> bool {
        !matches!(self, Phase::NoRebalance)
    }

    /// Whether a rebalance is in progress.
    pub fn is_rebalance(&self) -> bool {
        !matches!(self, Phase::NoRebalance)
    }

    /// The phase that follows this one.
    pub fn next(&self) -> Phase {
        match self {
            Phase::ReadOldWriteAll => Phase::ReadAllWriteAll,
            Phase::ReadAllWriteAll => Phase::ReadNewWriteAll,
            Phase::ReadNewWriteAll => Phase::Transitory,
            Phase::Transitory | Phase::NoRebalance => Phase::NoRebalance,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::NoRebalance => "NO_REBALANCE",
            Phase::ReadOldWriteAll => "READ_OLD_WRITE_ALL",
            Phase::ReadAllWriteAll => "READ_ALL_WRITE_ALL",
            Phase::ReadNewWriteAll => "READ_NEW_WRITE_ALL",
            Phase::Transitory => "TRANSITORY",
        };
        f.write_str(name)
    }
}

/// Why a topology was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyUpdateKind {
    /// Membership changed within the current phase. Never confirmed.
    ChUpdate,
    /// A new phase started.
    PhaseChange,
}

/// Topology of one cache. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Strictly increasing per cache.
    pub topology_id: TopologyId,
    /// Identifies the rebalance this topology belongs to.
    pub rebalance_id: u64,
    pub phase: Phase,
    pub kind: TopologyUpdateKind,
    pub current_ch: Arc<ConsistentHash>,
    pub pending_ch: Option<Arc<ConsistentHash>>,
    /// Union of current and pending, present while pending is.
    pub union_ch: Option<Arc<ConsistentHash>>,
    /// Cache members this topology was computed for.
    pub actual_members: Vec<Address>,
}

impl CacheTopology {
    /// Whether members must confirm this topology.
    pub fn requires_confirmation(&self) -> bool {
        self.kind == TopologyUpdateKind::PhaseChange && self.phase.requires_confirmation()
    }

    /// Hash used to locate owners for reads.
    pub fn read_consistent_hash(&self) -> &Arc<ConsistentHash> {
        match self.phase {
            Phase::NoRebalance | Phase::ReadOldWriteAll | Phase::Transitory => &self.current_ch,
            Phase::ReadAllWriteAll => self.union_ch.as_ref().unwrap_or(&self.current_ch),
            Phase::ReadNewWriteAll => self.pending_ch.as_ref().unwrap_or(&self.current_ch),
        }
    }

    /// Hash used to locate owners for writes.
    pub fn write_consistent_hash(&self) -> &Arc<ConsistentHash> {
        match self.phase {
            Phase::NoRebalance | Phase::Transitory => &self.current_ch,
            Phase::ReadOldWriteAll | Phase::ReadAllWriteAll | Phase::ReadNewWriteAll => {
                self.union_ch.as_ref().unwrap_or(&self.current_ch)
            }
        }
    }

    /// Owners to read `segment` from, primary first.
    pub fn read_owners(&self, segment: Segment) -> &[Address] {
        self.read_consistent_hash().locate_owners_for_segment(segment)
    }

    /// Owners to write `segment` to.
    pub fn write_owners(&self, segment: Segment) -> &[Address] {
        self.write_consistent_hash().locate_owners_for_segment(segment)
    }

    pub fn num_segments(&self) -> usize {
        self.current_ch.num_segments()
    }

    pub fn is_member(&self, address: &Address) -> bool {
        self.actual_members.contains(address)
    }
}

impl fmt::Display for CacheTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheTopology(id={}, rebalance={}, phase={}, members={:?})",
            self.topology_id, self.rebalance_id, self.phase, self.actual_members
        )
    }
}
