//! Membership and delivery collaborator the RPC layer is built on.

use crate::error::Result;
use crate::rpc::message::RpcMessage;
use crate::types::{Address, DeliverOrder};

/// Point-to-point delivery plus the current membership view.
///
/// Implementations must not block: `send` only enqueues.
pub trait Transport: Send + Sync {
    /// This node's address.
    fn address(&self) -> Address;

    /// Members of the current view, coordinator first.
    fn members(&self) -> Vec<Address>;

    /// Enqueue a message for `target`.
    fn send(&self, target: Address, message: RpcMessage, order: DeliverOrder) -> Result<()>;

    /// Enqueue one message for several targets.
    ///
    /// Transports that honour [`DeliverOrder::Total`] override this so that
    /// all targets see concurrent multicasts in one order.
    fn multicast(&self, targets: &[Address], message: RpcMessage, order: DeliverOrder) -> Result<()> {
        for target in targets {
            self.send(*target, message.clone(), order)?;
        }
        Ok(())
    }

    /// Send to every other member of the view.
    fn broadcast(&self, message: RpcMessage, order: DeliverOrder) -> Result<()> {
        let local = self.address();
        let others: Vec<Address> = self.members().into_iter().filter(|m| *m != local).collect();
        self.multicast(&others, message, order)
    }
}

/// Receives messages delivered by a [`Transport`].
pub trait InboundHandler: Send + Sync {
    fn handle(&self, origin: Address, message: RpcMessage);
}
