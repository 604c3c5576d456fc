//! In-memory network connecting several nodes in one process.
//!
//! Every node has one FIFO inbox drained by its own task, so messages from
//! one sender arrive in send order. Messages go through the bincode codec to
//! catch values that would not survive a real wire.

use crate::error::Result;
use crate::rpc::{decode_message, encode_message, InboundHandler, RpcMessage, Transport};
use crate::types::{Address, DeliverOrder};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

type Envelope = (Address, Vec<u8>);

#[derive(Default)]
struct NetworkInner {
    inboxes: RwLock<HashMap<Address, mpsc::UnboundedSender<Envelope>>>,
    pending: Mutex<HashMap<Address, mpsc::UnboundedReceiver<Envelope>>>,
    view: RwLock<Vec<Address>>,
    blocked: Mutex<HashSet<(Address, Address)>>,
    /// Held while a totally ordered multicast is enqueued.
    total_order: Mutex<()>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the inbox and transport of `address`.
    ///
    /// Messages queue up until [`attach`](Self::attach) starts delivery.
    pub fn transport(&self, address: Address) -> Arc<InMemoryTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inboxes.write().insert(address, tx);
        self.inner.pending.lock().insert(address, rx);
        Arc::new(InMemoryTransport {
            local: address,
            network: Arc::clone(&self.inner),
        })
    }

    /// Start delivering the inbox of `address` to `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, address: Address, handler: Arc<dyn InboundHandler>) {
        let Some(mut rx) = self.inner.pending.lock().remove(&address) else {
            warn!(node = %address, "No inbox to attach");
            return;
        };
        tokio::spawn(async move {
            while let Some((origin, bytes)) = rx.recv().await {
                match decode_message(&bytes) {
                    Ok(message) => handler.handle(origin, message),
                    Err(e) => warn!(node = %address, %origin, error = %e, "Failed to decode message"),
                }
            }
            trace!(node = %address, "Inbox closed");
        });
    }

    /// Install the membership view every transport reports.
    pub fn install_view(&self, members: &[Address]) {
        *self.inner.view.write() = members.to_vec();
    }

    pub fn view(&self) -> Vec<Address> {
        self.inner.view.read().clone()
    }

    /// Disconnect `address`: its inbox closes and messages to it are lost.
    pub fn kill(&self, address: Address) {
        self.inner.inboxes.write().remove(&address);
        self.inner.pending.lock().remove(&address);
    }

    /// Drop every message from `from` to `to`.
    pub fn block(&self, from: Address, to: Address) {
        self.inner.blocked.lock().insert((from, to));
    }

    pub fn unblock_all(&self) {
        self.inner.blocked.lock().clear();
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// [`Transport`] of one node on an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    local: Address,
    network: Arc<NetworkInner>,
}

impl Transport for InMemoryTransport {
    fn address(&self) -> Address {
        self.local
    }

    fn members(&self) -> Vec<Address> {
        self.network.view.read().clone()
    }

    fn send(&self, target: Address, message: RpcMessage, order: DeliverOrder) -> Result<()> {
        self.multicast(&[target], message, order)
    }

    fn multicast(&self, targets: &[Address], message: RpcMessage, order: DeliverOrder) -> Result<()> {
        let bytes = encode_message(&message)?;
        let _total = (order == DeliverOrder::Total).then(|| self.network.total_order.lock());
        for target in targets {
            self.enqueue(*target, bytes.clone());
        }
        Ok(())
    }
}

impl InMemoryTransport {
    fn enqueue(&self, target: Address, bytes: Vec<u8>) {
        if self.network.blocked.lock().contains(&(self.local, target)) {
            trace!(from = %self.local, to = %target, "Dropping blocked message");
            self.network.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let delivered = self
            .network
            .inboxes
            .read()
            .get(&target)
            .is_some_and(|inbox| inbox.send((self.local, bytes)).is_ok());
        if delivered {
            self.network.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            trace!(from = %self.local, to = %target, "Target unreachable, message lost");
            self.network.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
