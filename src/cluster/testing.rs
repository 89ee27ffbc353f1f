//! In-process membership for tests.
//!
//! A [`LoopbackNet`] connects any number of [`LoopbackMembership`] handles
//! through plain channels: broadcasts and queries are delivered to every
//! connected peer's event stream, and test code can partition nodes or
//! inject member-failed events to drive the failure paths deterministically.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::types::{
    ClusterError, ClusterEvent, InboundQuery, Member, MemberEvent, MemberEventKind, MemberStatus,
    Membership, QueryResponse, UserEvent,
};

struct NodeHandle {
    events: mpsc::Sender<ClusterEvent>,
    connected: bool,
}

#[derive(Default)]
pub struct LoopbackNet {
    nodes: Mutex<HashMap<String, NodeHandle>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a node and returns its membership handle plus event stream.
    pub fn register(
        self: &Arc<Self>,
        name: &str,
    ) -> (Arc<LoopbackMembership>, mpsc::Receiver<ClusterEvent>) {
        let (tx, rx) = mpsc::channel(256);
        self.nodes.lock().unwrap().insert(
            name.to_string(),
            NodeHandle {
                events: tx,
                connected: true,
            },
        );
        (
            Arc::new(LoopbackMembership {
                name: name.to_string(),
                net: self.clone(),
            }),
            rx,
        )
    }

    /// Connects or disconnects a node (a crude network partition).
    pub fn set_connected(&self, name: &str, connected: bool) {
        if let Some(handle) = self.nodes.lock().unwrap().get_mut(name) {
            handle.connected = connected;
        }
    }

    /// Delivers a member-failed event for `name` to every other node, as
    /// the failure detector would.
    pub fn fail_node(&self, name: &str) {
        let targets = self.peer_senders(name);
        for (_, tx) in targets {
            let _ = tx.try_send(ClusterEvent::Member(MemberEvent {
                kind: MemberEventKind::Failed,
                member: Member {
                    name: name.to_string(),
                    addr: "loopback".to_string(),
                    status: MemberStatus::Failed,
                },
            }));
        }
    }

    /// Senders for every connected node other than `from` (only if `from`
    /// itself is connected).
    fn peer_senders(&self, from: &str) -> Vec<(String, mpsc::Sender<ClusterEvent>)> {
        let nodes = self.nodes.lock().unwrap();
        let from_connected = nodes.get(from).map(|h| h.connected).unwrap_or(false);
        if !from_connected {
            return Vec::new();
        }
        nodes
            .iter()
            .filter(|(name, handle)| name.as_str() != from && handle.connected)
            .map(|(name, handle)| (name.clone(), handle.events.clone()))
            .collect()
    }

    fn member_list(&self) -> Vec<Member> {
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .map(|name| Member {
                name: name.clone(),
                addr: "loopback".to_string(),
                status: MemberStatus::Alive,
            })
            .collect()
    }
}

pub struct LoopbackMembership {
    name: String,
    net: Arc<LoopbackNet>,
}

#[async_trait]
impl Membership for LoopbackMembership {
    fn local_name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> Vec<Member> {
        self.net.member_list()
    }

    async fn join(&self, _seeds: &[String], _timeout: Duration) -> Result<usize, ClusterError> {
        Ok(self.net.peer_senders(&self.name).len())
    }

    async fn leave(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn broadcast(&self, name: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        for (_, tx) in self.net.peer_senders(&self.name) {
            let _ = tx
                .send(ClusterEvent::User(UserEvent {
                    name: name.to_string(),
                    payload: payload.clone(),
                }))
                .await;
        }
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<QueryResponse>, ClusterError> {
        let (agg_tx, agg_rx) = mpsc::channel(64);
        let deadline = tokio::time::Instant::now() + timeout;

        for (peer_name, tx) in self.net.peer_senders(&self.name) {
            let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(16);
            let _ = tx
                .send(ClusterEvent::Query(InboundQuery {
                    name: name.to_string(),
                    from: self.name.clone(),
                    payload: payload.clone(),
                    reply: reply_tx,
                }))
                .await;

            let agg_tx = agg_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return,
                        reply = reply_rx.recv() => match reply {
                            Some(payload) => {
                                let _ = agg_tx
                                    .send(QueryResponse {
                                        from: peer_name.clone(),
                                        payload,
                                    })
                                    .await;
                            }
                            None => return,
                        }
                    }
                }
            });
        }

        Ok(agg_rx)
    }
}
