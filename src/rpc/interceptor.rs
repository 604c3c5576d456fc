//! Interceptors composed around every outbound invocation.
//!
//! Interceptors run in registration order before the command is sent and in
//! reverse order afterwards. The [`InvocationContext`] carries everything an
//! interceptor may inspect or rewrite; no ambient state is consulted.

use crate::error::Result;
use crate::types::{Address, CacheName, Command, TopologyId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// One logical invocation flowing through the interceptor chain.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Invoking node.
    pub origin: Address,
    /// Command about to be sent. Interceptors may rewrite it.
    pub command: Command,
    /// Targets of the invocation.
    pub targets: Vec<Address>,
    /// Set when re-running a read-only command, e.g. a transactional replay.
    pub replay: bool,
}

impl InvocationContext {
    pub fn new(origin: Address, command: Command, targets: Vec<Address>) -> Self {
        Self {
            origin,
            command,
            targets,
            replay: false,
        }
    }

    /// Mark this invocation as a replay.
    pub fn as_replay(mut self) -> Self {
        self.replay = true;
        self
    }
}

/// Decorator around the core send.
pub trait RpcInterceptor: Send + Sync {
    /// Runs before the command is sent. An error aborts the invocation.
    fn before_invoke(&self, _ctx: &mut InvocationContext) -> Result<()> {
        Ok(())
    }

    /// Runs after the command was handed to the transport.
    fn after_invoke(&self, _ctx: &InvocationContext) {}
}

/// Run `before_invoke` on every interceptor in order.
pub(crate) fn run_before(
    interceptors: &[Arc<dyn RpcInterceptor>],
    ctx: &mut InvocationContext,
) -> Result<()> {
    for interceptor in interceptors {
        interceptor.before_invoke(ctx)?;
    }
    Ok(())
}

/// Run `after_invoke` on every interceptor in reverse order.
pub(crate) fn run_after(interceptors: &[Arc<dyn RpcInterceptor>], ctx: &InvocationContext) {
    for interceptor in interceptors.iter().rev() {
        interceptor.after_invoke(ctx);
    }
}

/// Source of the topology id a node currently uses for a cache.
pub trait TopologyIdSource: Send + Sync {
    fn topology_id(&self, cache: &CacheName) -> Option<TopologyId>;
}

/// Stamps data commands that carry no topology id with the local one.
pub struct TopologyIdInterceptor {
    source: Weak<dyn TopologyIdSource>,
}

impl TopologyIdInterceptor {
    pub fn new(source: Weak<dyn TopologyIdSource>) -> Self {
        Self { source }
    }
}

impl RpcInterceptor for TopologyIdInterceptor {
    fn before_invoke(&self, ctx: &mut InvocationContext) -> Result<()> {
        if ctx.command.topology_id.is_some() || !ctx.command.is_data_command() {
            return Ok(());
        }
        if let Some(source) = self.source.upgrade() {
            let topology_id = ctx.command.cache().and_then(|cache| source.topology_id(cache));
            if let Some(topology_id) = topology_id {
                trace!(
                    command = ctx.command.kind_name(),
                    topology_id,
                    "Stamping command with local topology id"
                );
                ctx.command.topology_id = Some(topology_id);
            }
        }
        Ok(())
    }
}

/// Counts invocations per command kind. Replays are not counted.
#[derive(Debug, Default)]
pub struct InvocationCounter {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl InvocationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocations of one command kind.
    pub fn count(&self, kind: &str) -> u64 {
        self.counts.lock().get(kind).copied().unwrap_or(0)
    }

    /// Invocations of all kinds.
    pub fn total(&self) -> u64 {
        self.counts.lock().values().sum()
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

impl RpcInterceptor for InvocationCounter {
    fn after_invoke(&self, ctx: &InvocationContext) {
        if ctx.replay {
            return;
        }
        *self.counts.lock().entry(ctx.command.kind_name()).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct FixedTopology(TopologyId);

    impl TopologyIdSource for FixedTopology {
        fn topology_id(&self, _cache: &CacheName) -> Option<TopologyId> {
            Some(self.0)
        }
    }

    struct Reject;

    impl RpcInterceptor for Reject {
        fn before_invoke(&self, _ctx: &mut InvocationContext) -> Result<()> {
            Err(Error::Internal("rejected".into()))
        }
    }

    fn ctx(command: Command) -> InvocationContext {
        InvocationContext::new(Address::new(1), command, vec![Address::new(2)])
    }

    #[test]
    fn test_topology_id_stamped_only_when_unset() {
        let source: Arc<dyn TopologyIdSource> = Arc::new(FixedTopology(9));
        let interceptor = TopologyIdInterceptor::new(Arc::downgrade(&source));

        let mut unset = ctx(Command::put("c", "k", "v"));
        interceptor.before_invoke(&mut unset).unwrap();
        assert_eq!(unset.command.topology_id, Some(9));

        let mut set = ctx(Command::put("c", "k", "v").with_topology_id(3));
        interceptor.before_invoke(&mut set).unwrap();
        assert_eq!(set.command.topology_id, Some(3));
    }

    #[test]
    fn test_counter_skips_replays() {
        let counter = Arc::new(InvocationCounter::new());
        let chain: Vec<Arc<dyn RpcInterceptor>> = vec![counter.clone()];

        let mut first = ctx(Command::get("c", "k"));
        run_before(&chain, &mut first).unwrap();
        run_after(&chain, &first);
        let replay = ctx(Command::get("c", "k")).as_replay();
        run_after(&chain, &replay);
        run_after(&chain, &ctx(Command::put("c", "k", "v")));

        assert_eq!(counter.count("get"), 1);
        assert_eq!(counter.count("put"), 1);
        assert_eq!(counter.total(), 2);
        counter.reset();
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_failing_interceptor_stops_chain() {
        let counter = Arc::new(InvocationCounter::new());
        let chain: Vec<Arc<dyn RpcInterceptor>> = vec![Arc::new(Reject), counter.clone()];
        let mut context = ctx(Command::get("c", "k"));
        assert!(run_before(&chain, &mut context).is_err());
    }
}
