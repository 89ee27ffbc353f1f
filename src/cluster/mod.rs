//! Cluster Membership & Replication
//!
//! Everything that makes the node part of a peer group:
//!
//! - **`types`**: the membership provider contract: member snapshots, the
//!   event stream sum type (member delta | user event | query) and the
//!   [`Membership`] trait the core consumes.
//! - **`gossip`**: the concrete UDP SWIM-style provider (failure detection
//!   with incarnation numbers, user-event fanout, query/response).
//! - **`events`**: the wire envelopes replicas exchange and their stable
//!   event names.
//! - **`replicator`**: maps local mutations to broadcasts, applies inbound
//!   events idempotently, runs the join-time full-state transfer and owns
//!   the readiness latch.
//!
//! Consistency model: eventual. Broadcasts are best-effort and unordered;
//! convergence relies on the idempotent apply rules plus the join-time
//! transfer, never on delivery guarantees.

pub mod events;
pub mod gossip;
pub mod replicator;
pub mod types;

pub use gossip::GossipMembership;
pub use replicator::{ClusterInfo, Replicator};
pub use types::{
    ClusterError, ClusterEvent, InboundQuery, Member, MemberEvent, MemberEventKind, MemberStatus,
    Membership, QueryResponse, UserEvent,
};

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod tests;
