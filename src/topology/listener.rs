//! Member-side callback for applied topologies.

use crate::topology::CacheTopology;
use crate::types::{CacheName, PhaseFailure};

/// Reacts to topologies applied on this member.
///
/// For topologies that require confirmation, the returned result is sent to
/// the coordinator once the callback finishes: `Ok` confirms the phase, an
/// error reports a [`PhaseFailure`] with the confirmation.
#[async_trait::async_trait]
pub trait TopologyListener: Send + Sync {
    async fn on_topology_update(
        &self,
        cache: &CacheName,
        topology: &CacheTopology,
    ) -> std::result::Result<(), PhaseFailure>;
}

/// Listener that accepts every topology immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTopologyListener;

#[async_trait::async_trait]
impl TopologyListener for NoopTopologyListener {
    async fn on_topology_update(
        &self,
        _cache: &CacheName,
        _topology: &CacheTopology,
    ) -> std::result::Result<(), PhaseFailure> {
        Ok(())
    }
}
