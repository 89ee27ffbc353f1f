use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::events::JobEventKind;
use crate::cluster::Replicator;
use crate::store::{Item, JobOutcome, Store, StoreError};

const DISPATCH_INTERVAL: Duration = Duration::from_secs(1);
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const STALE_JOB_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Externally supplied job body. Receives the item and a token that fires
/// on worker shutdown; implementations must return promptly once it does
/// and must not touch the store themselves.
pub type JobHandlerFn =
    Arc<dyn Fn(Item, CancellationToken) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Single-slot job runner.
///
/// One worker per node. Each dispatch tick claims at most one pending item
/// and drives it through the processing state machine, heartbeating while
/// the job body runs. A second ticker sweeps claims whose heartbeats went
/// silent, and peer-failure notifications trigger immediate reclaim of the
/// failed node's items.
pub struct Worker {
    store: Arc<Store>,
    replicator: Arc<Replicator>,
    node_name: String,
    handler: JobHandlerFn,
    processing: AtomicBool,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        store: Arc<Store>,
        replicator: Arc<Replicator>,
        node_name: &str,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            replicator,
            node_name: node_name.to_string(),
            handler: simulated_work_handler(),
            processing: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Replaces the simulated job body with a caller-supplied one.
    pub fn with_handler(
        store: Arc<Store>,
        replicator: Arc<Replicator>,
        node_name: &str,
        shutdown: CancellationToken,
        handler: JobHandlerFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            replicator,
            node_name: node_name.to_string(),
            handler,
            processing: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Spawns the worker loop. `peer_failed_rx` delivers names of peers the
    /// failure detector declared dead.
    pub fn start(self: &Arc<Self>, peer_failed_rx: mpsc::Receiver<String>) {
        info!("worker starting");
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run(peer_failed_rx).await;
        });
    }

    async fn run(&self, mut peer_failed_rx: mpsc::Receiver<String>) {
        let mut dispatch = tokio::time::interval(DISPATCH_INTERVAL);
        let mut stale = tokio::time::interval(STALE_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("worker loop exiting");
                    return;
                }
                _ = dispatch.tick() => {
                    if !self.processing.load(Ordering::Relaxed) {
                        self.try_claim_and_process().await;
                    }
                }
                _ = stale.tick() => {
                    self.sweep_stale().await;
                }
                Some(peer) = peer_failed_rx.recv() => {
                    self.reclaim_from(&peer).await;
                }
            }
        }
    }

    /// One dispatch attempt: claim the oldest pending item and run it to a
    /// terminal state, broadcasting every transition.
    pub async fn try_claim_and_process(&self) {
        let item = match self.store.claim_next(&self.node_name) {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(e) => {
                error!("failed to claim next job: {}", e);
                return;
            }
        };

        self.processing.store(true, Ordering::Relaxed);
        info!("claimed job {}", item.extern_id);
        self.replicator
            .broadcast_job_event(JobEventKind::Claimed, &item)
            .await;

        if let Err(e) = self.store.mark_processing(&item.extern_id) {
            error!("failed to mark {} as processing: {}", item.extern_id, e);
            self.release_and_announce(&item).await;
            self.processing.store(false, Ordering::Relaxed);
            return;
        }
        self.replicator
            .broadcast_job_event(JobEventKind::Started, &item)
            .await;

        let heartbeat = self.spawn_heartbeat(item.extern_id.clone());
        debug!("processing job {}: {}", item.extern_id, item.payload);
        let result = (self.handler)(item.clone(), self.shutdown.clone()).await;
        heartbeat.cancel();

        if self.shutdown.is_cancelled() {
            // Interrupted mid-job: hand the item back so a surviving node
            // (or this one after restart) can pick it up.
            info!("job {} interrupted by shutdown, releasing", item.extern_id);
            self.release_and_announce(&item).await;
            self.processing.store(false, Ordering::Relaxed);
            return;
        }

        match result {
            Ok(()) => {
                info!("job {} completed", item.extern_id);
                if let Err(e) = self.store.finalise(&item.extern_id, JobOutcome::Completed) {
                    error!("failed to finalise {}: {}", item.extern_id, e);
                }
                // Completion is itself replicated state: flip `done`
                // through the normal update path so peers converge on it.
                match self.store.update_payload(item.local_id, None, Some(true)) {
                    Ok(updated) => self.replicator.broadcast_updated(&updated).await,
                    Err(e) => error!("failed to mark {} done: {}", item.extern_id, e),
                }
                self.replicator
                    .broadcast_job_event(JobEventKind::Completed, &item)
                    .await;
            }
            Err(e) => {
                error!("job {} failed: {}", item.extern_id, e);
                if let Err(e) = self.store.finalise(&item.extern_id, JobOutcome::Failed) {
                    error!("failed to finalise {}: {}", item.extern_id, e);
                }
                self.replicator
                    .broadcast_job_event(JobEventKind::Failed, &item)
                    .await;
            }
        }

        self.processing.store(false, Ordering::Relaxed);
    }

    /// Heartbeats the claim until cancelled. Exits on its own when the
    /// claim was revoked underneath us (the sweep on some node released it).
    fn spawn_heartbeat(&self, extern_id: String) -> CancellationToken {
        let done = CancellationToken::new();
        let token = done.clone();
        let store = self.store.clone();
        let replicator = self.replicator.clone();
        let node_name = self.node_name.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            // The first tick of a tokio interval fires immediately; spend
            // it here so heartbeats are spaced a full interval apart.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {}
                }
                match store.heartbeat(&extern_id, &node_name) {
                    Ok(()) => {
                        debug!("heartbeat for job {}", extern_id);
                        replicator.broadcast_job_heartbeat(&extern_id).await;
                    }
                    Err(StoreError::NotOwned) => {
                        warn!("claim on {} was revoked, stopping heartbeat", extern_id);
                        return;
                    }
                    Err(e) => warn!("heartbeat for {} failed: {}", extern_id, e),
                }
            }
        });

        done
    }

    /// Releases every claim whose heartbeat went silent past the timeout.
    pub async fn sweep_stale(&self) {
        let stale = match self.store.stale_claims(STALE_JOB_TIMEOUT) {
            Ok(stale) => stale,
            Err(e) => {
                error!("failed to query stale claims: {}", e);
                return;
            }
        };
        if stale.is_empty() {
            return;
        }

        warn!("found {} stale claim(s)", stale.len());
        for item in stale {
            info!(
                "reclaiming stale job {} (was on {})",
                item.extern_id,
                item.claimer.as_deref().unwrap_or("?")
            );
            self.release_and_announce(&item).await;
        }
    }

    /// Immediately returns every item claimed by `peer` to the pending
    /// pool. Invoked when the failure detector declares the peer dead.
    pub async fn reclaim_from(&self, peer: &str) {
        let claims = match self.store.claims_of(peer) {
            Ok(claims) => claims,
            Err(e) => {
                error!("failed to list claims of {}: {}", peer, e);
                return;
            }
        };
        if claims.is_empty() {
            return;
        }

        info!("reclaiming {} job(s) from failed node {}", claims.len(), peer);
        for item in claims {
            self.release_and_announce(&item).await;
        }
    }

    async fn release_and_announce(&self, item: &Item) {
        if let Err(e) = self.store.release(&item.extern_id) {
            error!("failed to release job {}: {}", item.extern_id, e);
            return;
        }
        self.replicator
            .broadcast_job_event(JobEventKind::Released, item)
            .await;
    }
}

/// Default job body: simulated work of 5-10 s, slept in small slices so
/// shutdown interrupts promptly.
pub fn simulated_work_handler() -> JobHandlerFn {
    Arc::new(|item: Item, shutdown: CancellationToken| {
        Box::pin(async move {
            use rand::Rng;
            let duration = Duration::from_secs(rand::thread_rng().gen_range(5..=10));
            info!("job {} will take {:?}", item.extern_id, duration);

            let slice = Duration::from_millis(500);
            let mut elapsed = Duration::ZERO;
            while elapsed < duration {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("job {} interrupted by shutdown", item.extern_id);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(slice) => elapsed += slice,
                }
            }
            Ok(())
        }) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
    })
}
