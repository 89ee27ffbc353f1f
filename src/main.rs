use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Extension;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use todoq::api::handlers::{
    handle_create, handle_delete, handle_get, handle_info, handle_list, handle_ready,
    handle_update,
};
use todoq::cluster::{GossipMembership, Membership, Replicator};
use todoq::config::Config;
use todoq::store::Store;
use todoq::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "todoq")]
#[command(about = "Eventually-consistent replicated todo/work queue node")]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP server port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Database file path (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Node name (overrides config)
    #[arg(long = "node-name")]
    node_name: Option<String>,

    /// Gossip bind address (overrides config)
    #[arg(long = "serf-addr")]
    serf_addr: Option<String>,

    /// Generate a gossip encryption key and exit
    #[arg(long)]
    keygen: bool,
}

fn keygen() {
    use rand::RngCore;
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let encoded = BASE64.encode(key);

    println!("Generated gossip encryption key:");
    println!();
    println!("  {encoded}");
    println!();
    println!("Add it as cluster.encrypt_key in the configuration file of");
    println!("every node; all nodes must share the same key.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.keygen {
        keygen();
        return Ok(());
    }

    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Command line flags win over file values.
    if let Some(port) = args.port {
        cfg.node.http.port = port;
    }
    if let Some(db) = args.db {
        cfg.node.database.path = db;
    }
    if let Some(name) = args.node_name {
        cfg.node.name = name;
    }
    if let Some(addr) = args.serf_addr {
        cfg.node.serf.bind_addr = addr;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_filter())),
        )
        .init();

    tracing::info!(
        "starting todoq (node: {}, log_level: {})",
        cfg.node.name,
        cfg.log_level
    );

    let shutdown = install_shutdown_handler();

    // 1. Local store:
    tracing::info!("opening database at {}", cfg.node.database.path);
    let store = Arc::new(Store::open(&cfg.node.database.path)?);

    // 2. Gossip membership:
    let bind_addr: SocketAddr = cfg
        .node
        .serf
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid serf bind address {}: {e}", cfg.node.serf.bind_addr))?;
    let advertise_addr = match &cfg.node.serf.advertise_addr {
        Some(addr) => Some(addr.parse().map_err(|e| {
            anyhow::anyhow!("invalid serf advertise address {addr}: {e}")
        })?),
        None => None,
    };
    let key = cfg.gossip_key()?;
    let (membership, events) =
        GossipMembership::new(&cfg.node.name, bind_addr, advertise_addr, key).await?;
    membership.start();
    let membership_dyn: Arc<dyn Membership> = membership.clone();

    // 3. Replicator (event loop + join-time sync + readiness):
    let (peer_failed_tx, peer_failed_rx) = tokio::sync::mpsc::channel(16);
    let replicator = Replicator::new(
        store.clone(),
        membership_dyn,
        peer_failed_tx,
        shutdown.clone(),
    );
    replicator.start(events);

    // Join and sync in the background so the HTTP surface can report
    // not-ready while the retry/backoff sequence runs.
    let seeds = cfg.cluster.seeds.clone();
    let join_timeout = Duration::from_secs(cfg.cluster.join_timeout);
    let bootstrap = replicator.clone();
    tokio::spawn(async move {
        bootstrap.bootstrap(&seeds, join_timeout).await;
    });

    // 4. Worker:
    let worker = Worker::new(
        store.clone(),
        replicator.clone(),
        &cfg.node.name,
        shutdown.clone(),
    );
    worker.start(peer_failed_rx);

    // 5. HTTP surface:
    let app = Router::new()
        .route("/health/ready", get(handle_ready))
        .route("/health/info", get(handle_info))
        .route("/todos", get(handle_list).post(handle_create))
        .route(
            "/todos/:id",
            get(handle_get).put(handle_update).delete(handle_delete),
        )
        .layer(Extension(store.clone()))
        .layer(Extension(replicator.clone()));

    let http_addr = SocketAddr::from(([0, 0, 0, 0], cfg.node.http.port));
    tracing::info!("http server listening on {}", http_addr);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    // 6. Graceful teardown: the token has already stopped the worker and
    // replicator loops; say goodbye to the cluster last.
    tracing::info!("shutting down");
    if let Err(e) = membership.leave().await {
        tracing::warn!("error leaving cluster: {}", e);
    }
    if let Err(e) = membership.shutdown().await {
        tracing::warn!("error shutting down membership: {}", e);
    }
    tracing::info!("shutdown complete");

    Ok(())
}

/// Installs SIGINT/SIGTERM handlers; the returned token fires when either
/// signal arrives. Every long-running task watches it.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("failed to install SIGINT handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        token_clone.cancel();
    });

    token
}
