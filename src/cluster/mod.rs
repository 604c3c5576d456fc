//! Cluster membership views.

pub mod events;
pub mod membership;

pub use events::{LoggingEventListener, MemberEvent, MemberEventListener};
pub use membership::{ClusterMembership, MembershipView};
