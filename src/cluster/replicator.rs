//! Replication engine.
//!
//! Sits between the local [`Store`] and the membership layer. Outbound,
//! every committed local mutation is mapped to a broadcast; inbound, events
//! from peers are applied idempotently so replicas converge no matter how
//! often or in what order events arrive. The replicator also runs the
//! join-time full-state transfer and owns the node's readiness latch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{Item, ProcState, Store, StoreError};

use super::events::{
    CountResponse, FullStateAck, ItemEvent, ItemEventKind, JobEvent, JobEventKind,
    EVENT_ITEM_CREATED, EVENT_ITEM_DELETED, EVENT_ITEM_UPDATED, QUERY_COUNT, QUERY_FULL_STATE,
};
use super::types::{
    ClusterEvent, InboundQuery, Member, MemberEventKind, MemberStatus, Membership, UserEvent,
};

const JOIN_ATTEMPTS: u32 = 3;
const FULL_STATE_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const SYNC_WAIT_CAP: Duration = Duration::from_secs(30);
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(250);
const STREAM_PACING: Duration = Duration::from_millis(10);

/// Control-surface cluster information.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub node_name: String,
    pub ready: bool,
    pub cluster_mode: String,
    pub member_count: usize,
    pub members: Vec<Member>,
    pub total_items: i64,
    pub items_by_state: BTreeMap<String, i64>,
    pub job_events_seen: BTreeMap<String, u64>,
}

pub struct Replicator {
    store: Arc<Store>,
    membership: Arc<dyn Membership>,
    ready: AtomicBool,
    peer_failed_tx: mpsc::Sender<String>,
    job_events_seen: DashMap<String, u64>,
    shutdown: CancellationToken,
}

impl Replicator {
    /// `peer_failed_tx` carries the names of peers the failure detector
    /// gives up on; the worker drains the other end and reclaims their
    /// abandoned items.
    pub fn new(
        store: Arc<Store>,
        membership: Arc<dyn Membership>,
        peer_failed_tx: mpsc::Sender<String>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            membership,
            ready: AtomicBool::new(false),
            peer_failed_tx,
            job_events_seen: DashMap::new(),
            shutdown,
        })
    }

    fn local_name(&self) -> String {
        self.membership.local_name().to_string()
    }

    /// Spawns the event loop over the membership event stream.
    pub fn start(self: &Arc<Self>, mut events: mpsc::Receiver<ClusterEvent>) {
        let replicator = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = replicator.shutdown.cancelled() => {
                        debug!("replicator event loop exiting");
                        return;
                    }
                    event = events.recv() => event,
                };
                match event {
                    Some(event) => replicator.handle_event(event).await,
                    None => {
                        debug!("membership event stream closed");
                        return;
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Startup: join + full sync + readiness
    // ------------------------------------------------------------------

    /// Joins the cluster via the configured seeds and runs the join-time
    /// state transfer. Always leaves the node ready: a node that cannot
    /// reach any seed continues standalone.
    pub async fn bootstrap(&self, seeds: &[String], join_timeout: Duration) {
        if seeds.is_empty() {
            info!("no seeds configured, starting as first node");
            self.mark_ready();
            return;
        }

        info!("attempting to join cluster via seeds: {:?}", seeds);
        let mut joined = 0usize;
        for attempt in 0..JOIN_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_secs(2 * attempt as u64);
                info!(
                    "join retry {}/{} in {:?}",
                    attempt + 1,
                    JOIN_ATTEMPTS,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            match self.membership.join(seeds, join_timeout).await {
                Ok(0) => debug!("join attempt {} reached no peers", attempt + 1),
                Ok(n) => {
                    info!("joined cluster, {} peer(s) reachable", n);
                    joined = n;
                    break;
                }
                Err(e) => warn!("join attempt {} failed: {}", attempt + 1, e),
            }
        }

        if joined == 0 {
            warn!(
                "failed to join after {} attempts, continuing as standalone node",
                JOIN_ATTEMPTS
            );
            self.mark_ready();
            return;
        }

        self.request_full_sync().await;
        self.mark_ready();
    }

    /// Queries every peer for its item count, then waits (bounded) for the
    /// per-item `created` broadcasts the responders stream back.
    async fn request_full_sync(&self) {
        info!("requesting full state from cluster");

        let mut responses = match self
            .membership
            .query(QUERY_FULL_STATE, Vec::new(), FULL_STATE_QUERY_TIMEOUT)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                warn!("full state query failed: {}", e);
                return;
            }
        };

        // Every peer first acks with how many items it will stream.
        let peer_count = self
            .membership
            .members()
            .iter()
            .filter(|m| m.status == MemberStatus::Alive && m.name != self.membership.local_name())
            .count();
        let mut responders = 0usize;
        let mut expected_total: i64 = 0;
        let mut expected_union: i64 = 0;
        while let Some(resp) = responses.recv().await {
            match serde_json::from_slice::<FullStateAck>(&resp.payload) {
                Ok(ack) => {
                    info!("{} will stream {} item(s)", resp.from, ack.count);
                    responders += 1;
                    expected_total += ack.count;
                    expected_union = expected_union.max(ack.count);
                }
                Err(e) => warn!("bad full-state ack from {}: {}", resp.from, e),
            }
            if responders >= peer_count {
                break;
            }
        }

        if responders == 0 {
            info!("no peers answered the full-state query");
            return;
        }

        // The wait bound scales with the summed counts (responders pace at
        // ~100 items/s). The early exit targets the largest single
        // responder: replicas overlap, so the summed total overcounts, but
        // no responder can hold more than the union.
        let wait = SYNC_WAIT_CAP.min(Duration::from_secs((expected_total / 10) as u64 + 5));
        let deadline = Instant::now() + wait;
        info!(
            "waiting up to {:?} for {} item(s) from {} peer(s)",
            wait, expected_union, responders
        );

        loop {
            match self.store.count() {
                Ok(count) if count >= expected_union => {
                    info!("full sync complete: {} item(s) present", count);
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("count during sync failed: {}", e),
            }
            if Instant::now() >= deadline {
                warn!("full sync wait expired after {:?}, continuing anyway", wait);
                return;
            }
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    }

    fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("node is ready");
        }
    }

    /// Latched readiness plus a human-readable explanation.
    pub fn readiness(&self) -> (bool, &'static str) {
        if self.ready.load(Ordering::SeqCst) {
            (true, "ready")
        } else {
            (false, "node is still syncing with the cluster")
        }
    }

    pub fn info(&self) -> Result<ClusterInfo, StoreError> {
        let members = self.membership.members();
        let alive = members
            .iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .count();
        let mut items_by_state = BTreeMap::new();
        for state in [
            ProcState::Pending,
            ProcState::Claimed,
            ProcState::Processing,
            ProcState::Completed,
            ProcState::Failed,
        ] {
            items_by_state.insert(
                state.as_str().to_string(),
                self.store.count_by_proc_state(state)?,
            );
        }
        Ok(ClusterInfo {
            node_name: self.local_name(),
            ready: self.ready.load(Ordering::SeqCst),
            cluster_mode: if alive > 1 { "cluster" } else { "standalone" }.to_string(),
            member_count: members.len(),
            members,
            total_items: self.store.count()?,
            items_by_state,
            job_events_seen: self
                .job_events_seen
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Outbound: local mutation -> broadcast
    // ------------------------------------------------------------------

    /// Broadcast failures never fail the local operation that triggered
    /// them; reconciliation owns eventual delivery.
    pub async fn broadcast_item_event(&self, event: &ItemEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode {}: {}", event.event_name(), e);
                return;
            }
        };
        if let Err(e) = self.membership.broadcast(event.event_name(), payload).await {
            warn!(
                "failed to broadcast {} for {}: {}",
                event.event_name(),
                event.extern_id,
                e
            );
        } else {
            debug!("broadcast {}: {}", event.event_name(), event.extern_id);
        }
    }

    pub async fn broadcast_created(&self, item: &Item) {
        self.broadcast_item_event(&ItemEvent::created(item, self.membership.local_name()))
            .await;
    }

    pub async fn broadcast_updated(&self, item: &Item) {
        self.broadcast_item_event(&ItemEvent::updated(item, self.membership.local_name()))
            .await;
    }

    pub async fn broadcast_deleted(&self, extern_id: &str) {
        self.broadcast_item_event(&ItemEvent::deleted(extern_id, self.membership.local_name()))
            .await;
    }

    pub async fn broadcast_job_event(&self, kind: JobEventKind, item: &Item) {
        let event = JobEvent::new(
            kind,
            &item.extern_id,
            Some(item.local_id),
            self.membership.local_name(),
        );
        self.send_job_event(&event).await;
    }

    pub async fn broadcast_job_heartbeat(&self, extern_id: &str) {
        let event = JobEvent::new(
            JobEventKind::Heartbeat,
            extern_id,
            None,
            self.membership.local_name(),
        );
        self.send_job_event(&event).await;
    }

    async fn send_job_event(&self, event: &JobEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode {}: {}", event.event_name(), e);
                return;
            }
        };
        if let Err(e) = self.membership.broadcast(event.event_name(), payload).await {
            warn!(
                "failed to broadcast {} for {}: {}",
                event.event_name(),
                event.extern_id,
                e
            );
        }
    }

    // ------------------------------------------------------------------
    // Inbound: event loop
    // ------------------------------------------------------------------

    async fn handle_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::Member(delta) => {
                let member = &delta.member;
                match delta.kind {
                    MemberEventKind::Joined => {
                        if member.name == self.membership.local_name() {
                            // Our own join; sync is driven from bootstrap.
                            debug!("observed own join event");
                        } else {
                            info!("node joined: {} ({})", member.name, member.addr);
                        }
                    }
                    MemberEventKind::Left => {
                        info!("node left gracefully: {}", member.name);
                    }
                    MemberEventKind::Failed => {
                        warn!("node failed: {}", member.name);
                        if let Err(e) = self.peer_failed_tx.send(member.name.clone()).await {
                            debug!("no reclaim consumer for failed peer: {}", e);
                        }
                    }
                    MemberEventKind::Reaped => {
                        info!("node reaped: {}", member.name);
                    }
                }
            }
            ClusterEvent::User(user) => self.handle_user_event(user),
            ClusterEvent::Query(query) => self.handle_query(query),
        }
    }

    fn handle_user_event(&self, event: UserEvent) {
        match event.name.as_str() {
            EVENT_ITEM_CREATED | EVENT_ITEM_UPDATED | EVENT_ITEM_DELETED => {
                let parsed: ItemEvent = match serde_json::from_slice(&event.payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("failed to decode {}: {}", event.name, e);
                        return;
                    }
                };
                if parsed.origin_node == self.membership.local_name() {
                    return;
                }
                debug!(
                    "received {}: {} from {}",
                    event.name, parsed.extern_id, parsed.origin_node
                );
                if let Err(e) = self.apply_item_event(&parsed) {
                    warn!(
                        "failed to apply {} for {}: {}",
                        event.name, parsed.extern_id, e
                    );
                }
            }
            name if name.starts_with("job:") => {
                let parsed: JobEvent = match serde_json::from_slice(&event.payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("failed to decode {}: {}", event.name, e);
                        return;
                    }
                };
                if parsed.origin_node == self.membership.local_name() {
                    return;
                }
                // Remote job transitions are observational only: each node
                // is authoritative over its own claims.
                info!(
                    "job {} on {}: {}",
                    parsed.kind.as_str(),
                    parsed.origin_node,
                    parsed.extern_id
                );
                *self
                    .job_events_seen
                    .entry(parsed.kind.as_str().to_string())
                    .or_insert(0) += 1;
            }
            other => debug!("ignoring unknown user event {}", other),
        }
    }

    /// Applies one inbound item event. Safe under replays and reordering:
    /// `created` for an existing id is a no-op, `updated` for a missing id
    /// creates it, `deleted` for a missing id is a no-op.
    pub fn apply_item_event(&self, event: &ItemEvent) -> Result<(), StoreError> {
        match event.kind {
            ItemEventKind::Created => {
                if self.store.get_by_extern_id(&event.extern_id)?.is_some() {
                    debug!("item {} already exists, skipping", event.extern_id);
                    return Ok(());
                }
                let payload = event.payload.as_deref().unwrap_or_default();
                let item = match self.store.create(&event.extern_id, payload) {
                    Ok(item) => item,
                    // A concurrent apply won the insert; converged already.
                    Err(StoreError::Duplicate) => return Ok(()),
                    Err(e) => return Err(e),
                };
                if event.done == Some(true) {
                    self.store.update_payload(item.local_id, None, Some(true))?;
                }
                Ok(())
            }
            ItemEventKind::Updated => {
                match self.store.get_by_extern_id(&event.extern_id)? {
                    Some(existing) => {
                        self.store.update_payload(
                            existing.local_id,
                            event.payload.as_deref(),
                            event.done,
                        )?;
                    }
                    None => {
                        // Late arrival: the update precedes the create we
                        // never saw. Materialise the item from the update.
                        debug!("item {} unknown, creating from update", event.extern_id);
                        let payload = event.payload.as_deref().unwrap_or_default();
                        let item = match self.store.create(&event.extern_id, payload) {
                            Ok(item) => item,
                            Err(StoreError::Duplicate) => return Ok(()),
                            Err(e) => return Err(e),
                        };
                        if event.done == Some(true) {
                            self.store.update_payload(item.local_id, None, Some(true))?;
                        }
                    }
                }
                Ok(())
            }
            ItemEventKind::Deleted => {
                match self.store.get_by_extern_id(&event.extern_id)? {
                    Some(existing) => match self.store.delete(existing.local_id) {
                        Ok(()) | Err(StoreError::NotFound) => {}
                        Err(e) => return Err(e),
                    },
                    None => {
                        debug!("item {} already gone, nothing to delete", event.extern_id);
                    }
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound: queries
    // ------------------------------------------------------------------

    fn handle_query(&self, query: InboundQuery) {
        match query.name.as_str() {
            QUERY_FULL_STATE => self.handle_full_state_query(query),
            QUERY_COUNT => self.handle_count_query(query),
            other => debug!("ignoring unknown query {}", other),
        }
    }

    /// Acks with the local count, then streams every item as an individual
    /// `created` broadcast. Streaming reuses the steady-state idempotent
    /// apply path on the receiver and is paced to avoid overrunning the
    /// transport; it runs in a background task so the event loop stays
    /// responsive.
    fn handle_full_state_query(&self, query: InboundQuery) {
        info!("full state requested by {}", query.from);

        let count = match self.store.count() {
            Ok(count) => count,
            Err(e) => {
                warn!("failed to count items for {}: {}", query.from, e);
                return;
            }
        };
        let ack = match serde_json::to_vec(&FullStateAck { count }) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("failed to encode full-state ack: {}", e);
                return;
            }
        };
        if query.reply.try_send(ack).is_err() {
            warn!("failed to ack full-state query from {}", query.from);
            return;
        }

        let store = self.store.clone();
        let membership = self.membership.clone();
        let shutdown = self.shutdown.clone();
        let requester = query.from;
        tokio::spawn(async move {
            let items = match store.list() {
                Ok(items) => items,
                Err(e) => {
                    warn!("failed to list items for streaming: {}", e);
                    return;
                }
            };
            let total = items.len();
            for item in items {
                if shutdown.is_cancelled() {
                    return;
                }
                let event = ItemEvent::created(&item, membership.local_name());
                match serde_json::to_vec(&event) {
                    Ok(payload) => {
                        if let Err(e) = membership.broadcast(EVENT_ITEM_CREATED, payload).await {
                            warn!("failed to stream {}: {}", item.extern_id, e);
                        }
                    }
                    Err(e) => warn!("failed to encode {}: {}", item.extern_id, e),
                }
                tokio::time::sleep(STREAM_PACING).await;
            }
            info!("streamed {} item(s) for {}", total, requester);
        });
    }

    fn handle_count_query(&self, query: InboundQuery) {
        let count = match self.store.count() {
            Ok(count) => count,
            Err(e) => {
                warn!("failed to count items for {}: {}", query.from, e);
                return;
            }
        };
        let response = CountResponse {
            count,
            node_id: self.local_name(),
        };
        match serde_json::to_vec(&response) {
            Ok(payload) => {
                if query.reply.try_send(payload).is_err() {
                    warn!("failed to answer count query from {}", query.from);
                }
            }
            Err(e) => warn!("failed to encode count response: {}", e),
        }
    }
}
