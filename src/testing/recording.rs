//! Transport that records outbound messages instead of delivering them.

use crate::error::Result;
use crate::rpc::{RpcMessage, Transport};
use crate::types::{Address, Command, DeliverOrder};
use parking_lot::Mutex;
use std::sync::Arc;

/// Records every message; tests feed responses back by hand.
pub struct RecordingTransport {
    local: Address,
    members: Mutex<Vec<Address>>,
    sent: Mutex<Vec<(Address, RpcMessage)>>,
}

impl RecordingTransport {
    pub fn new(local: u64, members: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            local: Address::new(local),
            members: Mutex::new(members.iter().map(|id| Address::new(*id)).collect()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_members(&self, members: &[u64]) {
        *self.members.lock() = members.iter().map(|id| Address::new(*id)).collect();
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<(Address, RpcMessage)> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Request ids and commands sent to `target`. One-way sends have no id.
    pub fn requests_to(&self, target: u64) -> Vec<(Option<u64>, Command)> {
        self.sent
            .lock()
            .iter()
            .filter(|(addr, _)| *addr == Address::new(target))
            .filter_map(|(_, msg)| match msg {
                RpcMessage::Request {
                    request_id,
                    command,
                } => Some((*request_id, command.clone())),
                _ => None,
            })
            .collect()
    }

    /// Commands sent to `target`, without request ids.
    pub fn commands_to(&self, target: u64) -> Vec<Command> {
        self.requests_to(target)
            .into_iter()
            .map(|(_, command)| command)
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn address(&self) -> Address {
        self.local
    }

    fn members(&self) -> Vec<Address> {
        self.members.lock().clone()
    }

    fn send(&self, target: Address, message: RpcMessage, _order: DeliverOrder) -> Result<()> {
        self.sent.lock().push((target, message));
        Ok(())
    }
}
