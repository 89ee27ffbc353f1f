use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to join cluster: {0}")]
    JoinFailed(String),
    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] Box<bincode::ErrorKind>),
}

/// Membership status of a peer as reported through the contract.
///
/// Suspected-but-not-yet-failed peers are still reported `Alive`; failure
/// is only surfaced once the detector commits to it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Failed,
    Reaped,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Failed => "failed",
            MemberStatus::Reaped => "reaped",
        }
    }
}

/// A peer as seen by the local membership view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub name: String,
    pub addr: String,
    pub status: MemberStatus,
}

/// Kind of membership delta carried by a [`MemberEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Joined,
    Left,
    Failed,
    Reaped,
}

#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub member: Member,
}

/// A user event broadcast by some peer (or, on echo, by this node).
#[derive(Debug, Clone)]
pub struct UserEvent {
    pub name: String,
    pub payload: Vec<u8>,
}

/// One response to an outstanding fanout query.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

/// An inbound query with a handle for sending the reply back to the
/// requester. Dropping the handle without replying is allowed.
#[derive(Debug)]
pub struct InboundQuery {
    pub name: String,
    pub from: String,
    pub payload: Vec<u8>,
    pub reply: mpsc::Sender<Vec<u8>>,
}

/// Everything the membership provider can deliver on its event stream.
///
/// The stream interleaves membership deltas, user events and queries in
/// the order the provider observed them. Delivery is best-effort: consumers
/// must tolerate arbitrary loss.
#[derive(Debug)]
pub enum ClusterEvent {
    Member(MemberEvent),
    User(UserEvent),
    Query(InboundQuery),
}

/// The membership provider contract consumed by the replication core.
///
/// Implementations deliver their event stream through the `mpsc` receiver
/// handed out at construction time; the trait itself only carries the
/// operations the core invokes.
#[async_trait]
pub trait Membership: Send + Sync + 'static {
    /// Stable cluster-wide name of this node.
    fn local_name(&self) -> &str;

    /// Snapshot of the current membership view, this node included.
    fn members(&self) -> Vec<Member>;

    /// Attempts to contact the given seeds. Returns how many peers were
    /// reachable; `Ok(0)` means nobody answered within `timeout`.
    async fn join(&self, seeds: &[String], timeout: Duration) -> Result<usize, ClusterError>;

    /// Announces a graceful departure to the cluster.
    async fn leave(&self) -> Result<(), ClusterError>;

    /// Stops all background activity. Idempotent.
    async fn shutdown(&self) -> Result<(), ClusterError>;

    /// Best-effort at-most-once broadcast of a named user event.
    async fn broadcast(&self, name: &str, payload: Vec<u8>) -> Result<(), ClusterError>;

    /// Fanout request/response. The receiver yields responses as they come
    /// in and closes once `timeout` has elapsed.
    async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<QueryResponse>, ClusterError>;
}
