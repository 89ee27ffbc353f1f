//! UDP gossip membership provider.
//!
//! Implements the [`Membership`](super::types::Membership) contract with a
//! SWIM-style protocol: every node periodically pings one random alive peer,
//! acks piggyback the full member list, and missed contact moves a peer
//! through Suspect -> Dead with incarnation numbers resolving disputes (a
//! falsely suspected node bumps its incarnation and refutes). On top of the
//! failure detector the same socket carries user-event fanout and
//! query/response traffic for the replication layer.
//!
//! When an encryption key is configured every datagram is prefixed with a
//! 32-byte keyed SHA-256 tag and unauthenticated datagrams are dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::types::{
    ClusterError, ClusterEvent, InboundQuery, Member, MemberEvent, MemberEventKind, MemberStatus,
    Membership, QueryResponse, UserEvent,
};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const REAP_TIMEOUT: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 512;
const QUERY_REPLY_CAPACITY: usize = 16;
const TAG_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
enum PeerState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl PeerState {
    fn status(&self) -> MemberStatus {
        match self {
            // A suspected peer is still a member until the detector commits.
            PeerState::Alive | PeerState::Suspect => MemberStatus::Alive,
            PeerState::Dead => MemberStatus::Failed,
            PeerState::Left => MemberStatus::Leaving,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Peer {
    name: String,
    addr: SocketAddr,
    state: PeerState,
    incarnation: u64,
    #[serde(skip)]
    last_seen: Option<Instant>,
}

impl Peer {
    fn member(&self) -> Member {
        Member {
            name: self.name.clone(),
            addr: self.addr.to_string(),
            status: self.state.status(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum GossipMessage {
    Join {
        node: Peer,
    },
    Ping {
        from: String,
        incarnation: u64,
    },
    Ack {
        from: String,
        incarnation: u64,
        members: Vec<Peer>,
    },
    Suspect {
        name: String,
        incarnation: u64,
    },
    Alive {
        name: String,
        incarnation: u64,
    },
    Leave {
        name: String,
    },
    User {
        name: String,
        payload: Vec<u8>,
    },
    Query {
        id: u64,
        name: String,
        from: String,
        payload: Vec<u8>,
        reply_to: SocketAddr,
    },
    QueryResponse {
        id: u64,
        from: String,
        payload: Vec<u8>,
    },
}

pub struct GossipMembership {
    local_name: String,
    advertise_addr: SocketAddr,
    members: Arc<DashMap<String, Peer>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    events: mpsc::Sender<ClusterEvent>,
    pending_queries: Arc<DashMap<u64, mpsc::Sender<QueryResponse>>>,
    query_seq: AtomicU64,
    key: Option<[u8; 32]>,
    shutdown: CancellationToken,
}

impl GossipMembership {
    /// Binds the gossip socket and registers the local node. The returned
    /// receiver is the contract event stream; call [`start`](Self::start)
    /// to spawn the protocol loops.
    pub async fn new(
        node_name: &str,
        bind_addr: SocketAddr,
        advertise_addr: Option<SocketAddr>,
        key: Option<[u8; 32]>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ClusterEvent>), ClusterError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let advertise_addr = advertise_addr.unwrap_or(local_addr);

        let members = Arc::new(DashMap::new());
        members.insert(
            node_name.to_string(),
            Peer {
                name: node_name.to_string(),
                addr: advertise_addr,
                state: PeerState::Alive,
                incarnation: 1,
                last_seen: Some(Instant::now()),
            },
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let service = Arc::new(Self {
            local_name: node_name.to_string(),
            advertise_addr,
            members,
            socket: Arc::new(socket),
            incarnation: Arc::new(RwLock::new(1)),
            events: event_tx,
            pending_queries: Arc::new(DashMap::new()),
            query_seq: AtomicU64::new(1),
            key,
            shutdown: CancellationToken::new(),
        });

        Ok((service, event_rx))
    }

    pub fn start(self: &Arc<Self>) {
        info!("starting gossip membership on {}", self.advertise_addr);

        let service = self.clone();
        tokio::spawn(async move {
            service.gossip_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.receive_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.failure_detection_loop().await;
        });
    }

    fn frame(&self, msg: &GossipMessage) -> Result<Vec<u8>, ClusterError> {
        frame_with(&self.key, msg)
    }

    fn unframe<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        match &self.key {
            Some(key) => {
                if packet.len() < TAG_LEN {
                    return None;
                }
                let (tag, body) = packet.split_at(TAG_LEN);
                if keyed_tag(key, body)[..] != *tag {
                    return None;
                }
                Some(body)
            }
            None => Some(packet),
        }
    }

    async fn send_msg(&self, msg: &GossipMessage, addr: SocketAddr) {
        match self.frame(msg) {
            Ok(packet) => {
                if let Err(e) = self.socket.send_to(&packet, addr).await {
                    warn!("failed to send gossip message to {}: {}", addr, e);
                }
            }
            Err(e) => warn!("failed to encode gossip message: {}", e),
        }
    }

    /// Sends a message to every alive peer except this node.
    async fn fanout(&self, msg: &GossipMessage) {
        let targets: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().name != self.local_name && entry.value().state == PeerState::Alive
            })
            .map(|entry| entry.value().addr)
            .collect();

        for addr in targets {
            self.send_msg(msg, addr).await;
        }
    }

    fn local_peer(&self, incarnation: u64) -> Peer {
        Peer {
            name: self.local_name.clone(),
            addr: self.advertise_addr,
            state: PeerState::Alive,
            incarnation,
            last_seen: Some(Instant::now()),
        }
    }

    fn alive_peer_count(&self) -> usize {
        self.members
            .iter()
            .filter(|entry| {
                entry.value().name != self.local_name && entry.value().state == PeerState::Alive
            })
            .count()
    }

    fn emit(&self, event: ClusterEvent) {
        // The event stream is best-effort; a saturated consumer loses
        // events rather than stalling the UDP receive path.
        if let Err(e) = self.events.try_send(event) {
            warn!("dropping cluster event, consumer is behind: {}", e);
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let alive: Vec<Peer> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().name != self.local_name
                        && entry.value().state == PeerState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..alive.len());
            let target = &alive[idx];

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_name.clone(),
                incarnation,
            };
            trace!("ping -> {}", target.name);
            self.send_msg(&msg, target.addr).await;
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            let recv = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                r = self.socket.recv_from(&mut buf) => r,
            };

            match recv {
                Ok((len, src)) => {
                    let Some(body) = self.unframe(&buf[..len]) else {
                        warn!("dropping unauthenticated datagram from {}", src);
                        continue;
                    };
                    match bincode::deserialize::<GossipMessage>(body) {
                        Ok(msg) => self.handle_message(msg, src).await,
                        Err(e) => {
                            warn!("failed to decode datagram from {}: {}", src, e);
                        }
                    }
                }
                Err(e) => {
                    warn!("udp receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await;
            }
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
            }
            GossipMessage::Join { node } => {
                self.handle_join(node, src).await;
            }
            GossipMessage::Suspect { name, incarnation } => {
                self.handle_suspect(name, incarnation).await;
            }
            GossipMessage::Alive { name, incarnation } => {
                self.handle_alive(name, incarnation);
            }
            GossipMessage::Leave { name } => {
                self.handle_leave(name);
            }
            GossipMessage::User { name, payload } => {
                self.emit(ClusterEvent::User(UserEvent { name, payload }));
            }
            GossipMessage::Query {
                id,
                name,
                from,
                payload,
                mut reply_to,
            } => {
                if reply_to.ip().is_unspecified() {
                    reply_to = SocketAddr::new(src.ip(), reply_to.port());
                }
                self.handle_query(id, name, from, payload, reply_to);
            }
            GossipMessage::QueryResponse { id, from, payload } => {
                if let Some(pending) = self.pending_queries.get(&id) {
                    let _ = pending.value().try_send(QueryResponse { from, payload });
                } else {
                    trace!("response for expired query {}", id);
                }
            }
        }
    }

    async fn handle_ping(&self, from: String, from_incarnation: u64, src: SocketAddr) {
        trace!("ping <- {}", from);

        let mut newly_discovered = None;
        match self.members.get_mut(&from) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());
                if from_incarnation > member.incarnation {
                    member.incarnation = from_incarnation;
                }
            }
            None => {
                info!("discovered member {} at {} via ping", from, src);
                let peer = Peer {
                    name: from.clone(),
                    addr: src,
                    state: PeerState::Alive,
                    incarnation: from_incarnation,
                    last_seen: Some(Instant::now()),
                };
                self.members.insert(from.clone(), peer.clone());
                newly_discovered = Some(peer);
            }
        }
        if let Some(peer) = newly_discovered {
            self.emit(ClusterEvent::Member(MemberEvent {
                kind: MemberEventKind::Joined,
                member: peer.member(),
            }));
        }

        let members: Vec<Peer> = self.members.iter().map(|e| e.value().clone()).collect();
        let incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_name.clone(),
            incarnation,
            members,
        };
        self.send_msg(&reply, src).await;
    }

    fn handle_ack(&self, from: String, from_incarnation: u64, members: Vec<Peer>) {
        trace!("ack <- {} ({} members)", from, members.len());

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, incoming: Peer) {
        if incoming.name == self.local_name {
            return;
        }

        let mut joined = None;
        let mut failed = None;
        match self.members.get_mut(&incoming.name) {
            Some(mut existing) => {
                if incoming.incarnation > existing.incarnation {
                    let was_failed = existing.state == PeerState::Dead;
                    let now_failed = incoming.state == PeerState::Dead;
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.last_seen = Some(Instant::now());
                    if !was_failed && now_failed {
                        failed = Some(existing.clone());
                    }
                } else if incoming.incarnation == existing.incarnation
                    && incoming.state == PeerState::Alive
                    && existing.state == PeerState::Suspect
                {
                    debug!("{} refuted suspicion", incoming.name);
                    existing.state = PeerState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if incoming.state == PeerState::Alive {
                    info!("discovered member {} at {}", incoming.name, incoming.addr);
                    let mut peer = incoming;
                    peer.last_seen = Some(Instant::now());
                    joined = Some(peer.clone());
                    self.members.insert(peer.name.clone(), peer);
                }
            }
        }

        if let Some(peer) = joined {
            self.emit(ClusterEvent::Member(MemberEvent {
                kind: MemberEventKind::Joined,
                member: peer.member(),
            }));
        }
        if let Some(peer) = failed {
            self.emit(ClusterEvent::Member(MemberEvent {
                kind: MemberEventKind::Failed,
                member: peer.member(),
            }));
        }
    }

    async fn handle_join(&self, mut node: Peer, src: SocketAddr) {
        info!("node {} joining from {}", node.name, node.addr);

        // A node bound to a wildcard address advertises an unroutable IP;
        // substitute the address the datagram actually came from.
        if node.addr.ip().is_unspecified() {
            node.addr = SocketAddr::new(src.ip(), node.addr.port());
        }
        node.last_seen = Some(Instant::now());
        node.state = PeerState::Alive;
        let is_new = !self.members.contains_key(&node.name);
        self.members.insert(node.name.clone(), node.clone());

        if is_new {
            self.emit(ClusterEvent::Member(MemberEvent {
                kind: MemberEventKind::Joined,
                member: node.member(),
            }));
        }

        // Ack straight back with the member list so the joiner converges
        // without waiting for the next gossip round.
        let members: Vec<Peer> = self.members.iter().map(|e| e.value().clone()).collect();
        let incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_name.clone(),
            incarnation,
            members,
        };
        self.send_msg(&reply, src).await;
    }

    async fn handle_suspect(&self, name: String, incarnation: u64) {
        if name == self.local_name {
            // Refute: bump our incarnation and announce we are alive.
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                *inc += 1;
                *inc
            };
            info!("refuting suspicion with incarnation {}", my_incarnation);
            if let Some(mut me) = self.members.get_mut(&self.local_name) {
                me.incarnation = my_incarnation;
            }
            let msg = GossipMessage::Alive {
                name: self.local_name.clone(),
                incarnation: my_incarnation,
            };
            self.fanout(&msg).await;
            return;
        }

        if let Some(mut existing) = self.members.get_mut(&name) {
            if incarnation >= existing.incarnation && existing.state == PeerState::Alive {
                info!("node {} suspected", name);
                existing.state = PeerState::Suspect;
                existing.incarnation = incarnation;
            }
        }
    }

    fn handle_alive(&self, name: String, incarnation: u64) {
        if let Some(mut existing) = self.members.get_mut(&name) {
            if incarnation > existing.incarnation
                || (incarnation == existing.incarnation && existing.state == PeerState::Suspect)
            {
                debug!("node {} alive (incarnation {})", name, incarnation);
                existing.state = PeerState::Alive;
                existing.incarnation = incarnation;
                existing.last_seen = Some(Instant::now());
            }
        }
    }

    fn handle_leave(&self, name: String) {
        let mut left = None;
        if let Some(mut existing) = self.members.get_mut(&name) {
            if existing.state != PeerState::Left {
                info!("node {} left gracefully", name);
                existing.state = PeerState::Left;
                existing.last_seen = Some(Instant::now());
                left = Some(existing.clone());
            }
        }
        if let Some(peer) = left {
            self.emit(ClusterEvent::Member(MemberEvent {
                kind: MemberEventKind::Left,
                member: peer.member(),
            }));
        }
    }

    fn handle_query(
        &self,
        id: u64,
        name: String,
        from: String,
        payload: Vec<u8>,
        reply_to: SocketAddr,
    ) {
        let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(QUERY_REPLY_CAPACITY);

        // Forward whatever the handler replies back to the requester.
        let socket = self.socket.clone();
        let key = self.key;
        let local_name = self.local_name.clone();
        tokio::spawn(async move {
            while let Some(payload) = reply_rx.recv().await {
                let msg = GossipMessage::QueryResponse {
                    id,
                    from: local_name.clone(),
                    payload,
                };
                match frame_with(&key, &msg) {
                    Ok(packet) => {
                        if let Err(e) = socket.send_to(&packet, reply_to).await {
                            warn!("failed to send query response to {}: {}", reply_to, e);
                        }
                    }
                    Err(e) => warn!("failed to encode query response: {}", e),
                }
            }
        });

        self.emit(ClusterEvent::Query(InboundQuery {
            name,
            from,
            payload,
            reply: reply_tx,
        }));
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            let mut suspects = Vec::new();
            let mut newly_failed = Vec::new();
            let mut reap = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();
                if member.name == self.local_name {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    PeerState::Alive => {
                        if elapsed > SUSPECT_TIMEOUT {
                            warn!("node {} suspected (silent for {:?})", member.name, elapsed);
                            member.state = PeerState::Suspect;
                            suspects.push(GossipMessage::Suspect {
                                name: member.name.clone(),
                                incarnation: member.incarnation,
                            });
                        }
                    }
                    PeerState::Suspect => {
                        if elapsed > DEAD_TIMEOUT {
                            warn!("node {} declared failed", member.name);
                            member.state = PeerState::Dead;
                            newly_failed.push(member.clone());
                        }
                    }
                    PeerState::Dead | PeerState::Left => {
                        if elapsed > REAP_TIMEOUT {
                            reap.push(member.clone());
                        }
                    }
                }
            }

            for msg in suspects {
                self.fanout(&msg).await;
            }
            for peer in newly_failed {
                self.emit(ClusterEvent::Member(MemberEvent {
                    kind: MemberEventKind::Failed,
                    member: peer.member(),
                }));
            }
            for peer in reap {
                debug!("reaping {}", peer.name);
                self.members.remove(&peer.name);
                let mut member = peer.member();
                member.status = MemberStatus::Reaped;
                self.emit(ClusterEvent::Member(MemberEvent {
                    kind: MemberEventKind::Reaped,
                    member,
                }));
            }
        }
    }
}

#[async_trait]
impl Membership for GossipMembership {
    fn local_name(&self) -> &str {
        &self.local_name
    }

    fn members(&self) -> Vec<Member> {
        self.members.iter().map(|e| e.value().member()).collect()
    }

    async fn join(&self, seeds: &[String], timeout: Duration) -> Result<usize, ClusterError> {
        let incarnation = *self.incarnation.read().await;
        let node = self.local_peer(incarnation);

        let mut contacted = 0usize;
        for seed in seeds {
            let addr: SocketAddr = match tokio::net::lookup_host(seed.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        warn!("seed {} resolved to no addresses", seed);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("failed to resolve seed {}: {}", seed, e);
                    continue;
                }
            };
            self.send_msg(&GossipMessage::Join { node: node.clone() }, addr)
                .await;
            contacted += 1;
        }

        if contacted == 0 {
            return Err(ClusterError::JoinFailed(
                "no seed address was resolvable".to_string(),
            ));
        }

        // Joining is confirmed by peers appearing in the member table.
        let deadline = Instant::now() + timeout;
        loop {
            let peers = self.alive_peer_count();
            if peers > 0 {
                return Ok(peers);
            }
            if Instant::now() >= deadline {
                return Ok(0);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn leave(&self) -> Result<(), ClusterError> {
        info!("announcing graceful leave");
        let msg = GossipMessage::Leave {
            name: self.local_name.clone(),
        };
        self.fanout(&msg).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ClusterError> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn broadcast(&self, name: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        let msg = GossipMessage::User {
            name: name.to_string(),
            payload,
        };
        self.fanout(&msg).await;
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<QueryResponse>, ClusterError> {
        let id = self.query_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(QUERY_REPLY_CAPACITY * 4);
        self.pending_queries.insert(id, tx);

        // Expire the query after the deadline; dropping the sender closes
        // the receiver stream.
        let pending = self.pending_queries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            pending.remove(&id);
        });

        let msg = GossipMessage::Query {
            id,
            name: name.to_string(),
            from: self.local_name.clone(),
            payload,
            reply_to: self.advertise_addr,
        };
        self.fanout(&msg).await;

        Ok(rx)
    }
}

fn keyed_tag(key: &[u8; 32], body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(body);
    hasher.finalize().into()
}

fn frame_with(key: &Option<[u8; 32]>, msg: &GossipMessage) -> Result<Vec<u8>, ClusterError> {
    let body = bincode::serialize(msg)?;
    match key {
        Some(key) => {
            let mut packet = keyed_tag(key, &body).to_vec();
            packet.extend_from_slice(&body);
            Ok(packet)
        }
        None => Ok(body),
    }
}
