//! Installed membership view.
//!
//! Views are supplied by an external group-membership service. This module
//! only tracks the latest one, numbers it, and turns the difference with the
//! previous view into [`MemberEvent`]s.

use crate::cluster::events::{MemberEvent, MemberEventListener};
use crate::types::Address;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// An installed membership view. The first member is the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipView {
    pub view_id: u64,
    pub members: Vec<Address>,
}

impl MembershipView {
    pub fn coordinator(&self) -> Option<Address> {
        self.members.first().copied()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    /// Events turning `self` into `next`.
    pub fn diff(&self, next: &MembershipView) -> Vec<MemberEvent> {
        let view_id = next.view_id;
        let mut events: Vec<MemberEvent> = self
            .members
            .iter()
            .filter(|member| !next.contains(member))
            .map(|&address| MemberEvent::Left { address, view_id })
            .collect();
        events.extend(
            next.members
                .iter()
                .filter(|member| !self.contains(member))
                .map(|&address| MemberEvent::Joined { address, view_id }),
        );
        if let Some(current) = next.coordinator() {
            if self.coordinator() != Some(current) {
                events.push(MemberEvent::CoordinatorChanged {
                    previous: self.coordinator(),
                    current,
                    view_id,
                });
            }
        }
        events
    }
}

/// Tracks the latest installed view of one node.
pub struct ClusterMembership {
    local: Address,
    view: RwLock<MembershipView>,
    listeners: RwLock<Vec<Arc<dyn MemberEventListener>>>,
}

impl ClusterMembership {
    pub fn new(local: Address) -> Self {
        Self {
            local,
            view: RwLock::new(MembershipView::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn local(&self) -> Address {
        self.local
    }

    pub fn add_listener(&self, listener: Arc<dyn MemberEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn view(&self) -> MembershipView {
        self.view.read().clone()
    }

    pub fn is_coordinator(&self) -> bool {
        self.view.read().coordinator() == Some(self.local)
    }

    /// Install `members` as the next view.
    ///
    /// Returns the events of the change, or `None` if the members did not
    /// change.
    pub fn install(&self, members: &[Address]) -> Option<Vec<MemberEvent>> {
        let events = {
            let mut view = self.view.write();
            if view.members == members {
                return None;
            }
            let next = MembershipView {
                view_id: view.view_id + 1,
                members: members.to_vec(),
            };
            let events = view.diff(&next);
            debug!(node = %self.local, view_id = next.view_id, members = ?next.members, "Installing view");
            *view = next;
            events
        };

        let listeners = self.listeners.read().clone();
        for event in &events {
            for listener in &listeners {
                listener.on_event(*event);
            }
        }
        Some(events)
    }
}
