//! Membership view change events.

use crate::types::Address;

/// A member appeared in or disappeared from the installed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    /// The member is part of the new view but was not part of the old one.
    Joined {
        /// The member's address.
        address: Address,
        /// View that introduced it.
        view_id: u64,
    },

    /// The member left or was excluded from the view.
    Left {
        /// The member's address.
        address: Address,
        /// View that removed it.
        view_id: u64,
    },

    /// The coordinator of the new view differs from the old one.
    CoordinatorChanged {
        /// Previous coordinator, if any.
        previous: Option<Address>,
        /// New coordinator.
        current: Address,
        view_id: u64,
    },
}

impl MemberEvent {
    /// View the event belongs to.
    pub fn view_id(&self) -> u64 {
        match self {
            MemberEvent::Joined { view_id, .. }
            | MemberEvent::Left { view_id, .. }
            | MemberEvent::CoordinatorChanged { view_id, .. } => *view_id,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, MemberEvent::Joined { .. })
    }

    pub fn is_leave(&self) -> bool {
        matches!(self, MemberEvent::Left { .. })
    }
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called for each event of a newly installed view.
    fn on_event(&self, event: MemberEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl MemberEventListener for LoggingEventListener {
    fn on_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::Joined { address, view_id } => {
                tracing::info!(node = %address, view_id, "Member joined view");
            }
            MemberEvent::Left { address, view_id } => {
                tracing::warn!(node = %address, view_id, "Member left view");
            }
            MemberEvent::CoordinatorChanged {
                previous,
                current,
                view_id,
            } => {
                tracing::info!(previous = ?previous, current = %current, view_id, "Coordinator changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        let join = MemberEvent::Joined {
            address: Address::new(1),
            view_id: 3,
        };
        assert!(join.is_join());
        assert!(!join.is_leave());
        assert_eq!(join.view_id(), 3);

        let left = MemberEvent::Left {
            address: Address::new(1),
            view_id: 4,
        };
        assert!(left.is_leave());
    }
}
