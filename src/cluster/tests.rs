//! Cluster Module Tests
//!
//! Validates the replication layer against the convergence rules it
//! promises: idempotent event application under replay and reordering,
//! echo suppression, the join-time full-state transfer, readiness
//! latching, and two-node convergence after exchanging broadcasts.
//!
//! All tests run over the in-process loopback membership; the UDP gossip
//! provider has its own socket-level tests next to its implementation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::cluster::events::{
    CountResponse, ItemEvent, ItemEventKind, JobEvent, JobEventKind, EVENT_ITEM_CREATED,
    EVENT_JOB_CLAIMED, QUERY_COUNT,
};
use crate::cluster::testing::LoopbackNet;
use crate::cluster::{Membership, Replicator};
use crate::store::{ProcState, Store};

struct Node {
    _dir: TempDir,
    store: Arc<Store>,
    replicator: Arc<Replicator>,
}

/// Registers a node on the loopback net with a fresh store and a running
/// replicator event loop.
fn spawn_node(net: &Arc<LoopbackNet>, name: &str) -> Node {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(Store::open(dir.path().join("items.db")).expect("open store"));
    let (membership, events) = net.register(name);
    let (failed_tx, _failed_rx) = mpsc::channel(16);
    let replicator = Replicator::new(
        store.clone(),
        membership,
        failed_tx,
        tokio_util::sync::CancellationToken::new(),
    );
    replicator.start(events);
    Node {
        _dir: dir,
        store,
        replicator,
    }
}

/// Polls until `predicate` holds or the deadline passes.
async fn wait_for(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn item_set(store: &Store) -> BTreeSet<(String, String, bool)> {
    store
        .list()
        .unwrap()
        .into_iter()
        .map(|i| (i.extern_id, i.payload, i.done))
        .collect()
}

// ============================================================
// EVENT ENCODING
// ============================================================

#[test]
fn test_item_event_wire_format() {
    let event = ItemEvent {
        kind: ItemEventKind::Created,
        extern_id: "t-1".to_string(),
        payload: Some("buy milk".to_string()),
        done: Some(false),
        origin_node: "node-a".to_string(),
        ts: 123,
    };

    let json: serde_json::Value = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "created");
    assert_eq!(json["extern_id"], "t-1");
    assert_eq!(json["payload"], "buy milk");
    assert_eq!(json["done"], false);
    assert_eq!(json["origin_node"], "node-a");

    // Absent optionals stay off the wire.
    let deleted = ItemEvent::deleted("t-1", "node-a");
    let json: serde_json::Value = serde_json::to_value(&deleted).unwrap();
    assert_eq!(json["type"], "deleted");
    assert!(json.get("payload").is_none());
    assert!(json.get("done").is_none());
}

#[test]
fn test_job_event_names() {
    let event = JobEvent::new(JobEventKind::Claimed, "t-1", Some(4), "node-a");
    assert_eq!(event.event_name(), "job:claimed");
    let event = JobEvent::new(JobEventKind::Released, "t-1", None, "node-a");
    assert_eq!(event.event_name(), "job:released");

    let json: serde_json::Value = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "released");
    assert!(json.get("local_id").is_none());
}

// ============================================================
// IDEMPOTENT APPLICATION
// ============================================================

#[tokio::test]
async fn test_apply_created_is_idempotent() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");

    let event = ItemEvent {
        kind: ItemEventKind::Created,
        extern_id: "t-1".to_string(),
        payload: Some("first".to_string()),
        done: Some(false),
        origin_node: "node-b".to_string(),
        ts: 1,
    };

    for _ in 0..3 {
        node.replicator.apply_item_event(&event).unwrap();
    }

    let items = node.store.list().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].payload, "first");
    assert!(!items[0].done);
}

#[tokio::test]
async fn test_apply_created_honours_done_flag() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");

    let event = ItemEvent {
        kind: ItemEventKind::Created,
        extern_id: "t-1".to_string(),
        payload: Some("done already".to_string()),
        done: Some(true),
        origin_node: "node-b".to_string(),
        ts: 1,
    };
    node.replicator.apply_item_event(&event).unwrap();

    let item = node.store.get_by_extern_id("t-1").unwrap().unwrap();
    assert!(item.done);
}

#[tokio::test]
async fn test_updated_before_created_heals() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");

    // The update races ahead of the create it logically follows.
    let updated = ItemEvent {
        kind: ItemEventKind::Updated,
        extern_id: "t-1".to_string(),
        payload: Some("newer".to_string()),
        done: Some(true),
        origin_node: "node-b".to_string(),
        ts: 2,
    };
    node.replicator.apply_item_event(&updated).unwrap();

    let item = node.store.get_by_extern_id("t-1").unwrap().unwrap();
    assert_eq!(item.payload, "newer");
    assert!(item.done);

    // The late create must not clobber the newer state.
    let created = ItemEvent {
        kind: ItemEventKind::Created,
        extern_id: "t-1".to_string(),
        payload: Some("older".to_string()),
        done: Some(false),
        origin_node: "node-b".to_string(),
        ts: 1,
    };
    node.replicator.apply_item_event(&created).unwrap();

    let items = node.store.list().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].payload, "newer");
    assert!(items[0].done);
}

#[tokio::test]
async fn test_apply_deleted_is_idempotent() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");
    node.store.create("t-1", "x").unwrap();

    let event = ItemEvent::deleted("t-1", "node-b");
    node.replicator.apply_item_event(&event).unwrap();
    assert!(node.store.get_by_extern_id("t-1").unwrap().is_none());

    // Replay on the now-empty store is a no-op.
    node.replicator.apply_item_event(&event).unwrap();
    assert_eq!(node.store.count().unwrap(), 0);
}

// ============================================================
// EVENT LOOP BEHAVIOUR
// ============================================================

#[tokio::test]
async fn test_echo_suppression_by_origin_node() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");
    let (other, _other_events) = net.register("node-x");

    // An event claiming to originate from node-a itself must be dropped,
    // no matter who transported it.
    let echo = ItemEvent {
        kind: ItemEventKind::Created,
        extern_id: "t-echo".to_string(),
        payload: Some("loop".to_string()),
        done: None,
        origin_node: "node-a".to_string(),
        ts: 1,
    };
    other
        .broadcast(EVENT_ITEM_CREATED, serde_json::to_vec(&echo).unwrap())
        .await
        .unwrap();

    // A genuine foreign event on the same channel proves delivery works.
    let foreign = ItemEvent {
        kind: ItemEventKind::Created,
        extern_id: "t-real".to_string(),
        payload: Some("real".to_string()),
        done: None,
        origin_node: "node-x".to_string(),
        ts: 2,
    };
    other
        .broadcast(EVENT_ITEM_CREATED, serde_json::to_vec(&foreign).unwrap())
        .await
        .unwrap();

    wait_for("foreign event to apply", || {
        node.store.get_by_extern_id("t-real").unwrap().is_some()
    })
    .await;
    assert!(node.store.get_by_extern_id("t-echo").unwrap().is_none());
}

#[tokio::test]
async fn test_remote_job_events_do_not_touch_proc_state() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");
    let (other, _other_events) = net.register("node-x");

    let item = node.store.create("t-1", "x").unwrap();

    let claimed = JobEvent::new(JobEventKind::Claimed, "t-1", Some(item.local_id), "node-x");
    other
        .broadcast(EVENT_JOB_CLAIMED, serde_json::to_vec(&claimed).unwrap())
        .await
        .unwrap();

    wait_for("job event to be observed", || {
        node.replicator
            .info()
            .unwrap()
            .job_events_seen
            .get("claimed")
            .copied()
            .unwrap_or(0)
            == 1
    })
    .await;

    // Observational only: the local row is untouched.
    let item = node.store.get_by_extern_id("t-1").unwrap().unwrap();
    assert_eq!(item.proc_state, ProcState::Pending);
    assert!(item.claimer.is_none());
}

// ============================================================
// QUERIES & FULL SYNC
// ============================================================

#[tokio::test]
async fn test_count_query_responder() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");
    let (other, _other_events) = net.register("node-x");

    node.store.create("t-1", "a").unwrap();
    node.store.create("t-2", "b").unwrap();

    let mut responses = other
        .query(QUERY_COUNT, Vec::new(), Duration::from_secs(2))
        .await
        .unwrap();
    let response = timeout(Duration::from_secs(2), responses.recv())
        .await
        .expect("count query timed out")
        .expect("no response");

    let parsed: CountResponse = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(parsed.count, 2);
    assert_eq!(parsed.node_id, "node-a");
}

#[tokio::test]
async fn test_bootstrap_runs_full_state_transfer() {
    let net = LoopbackNet::new();
    let seeded = spawn_node(&net, "node-a");
    for i in 1..=5 {
        seeded.store.create(&format!("t-{i}"), "payload").unwrap();
    }

    let joiner = spawn_node(&net, "node-b");
    assert!(!joiner.replicator.readiness().0);

    joiner
        .replicator
        .bootstrap(&["node-a:7946".to_string()], Duration::from_secs(1))
        .await;

    assert!(joiner.replicator.readiness().0);
    wait_for("streamed items to apply", || {
        joiner.store.count().unwrap() == 5
    })
    .await;

    let ids: BTreeSet<String> = joiner
        .store
        .list()
        .unwrap()
        .into_iter()
        .map(|i| i.extern_id)
        .collect();
    assert_eq!(
        ids,
        (1..=5).map(|i| format!("t-{i}")).collect::<BTreeSet<_>>()
    );
}

#[tokio::test]
async fn test_bootstrap_without_seeds_is_immediately_ready() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");

    assert!(!node.replicator.readiness().0);
    node.replicator.bootstrap(&[], Duration::from_secs(1)).await;

    let (ready, message) = node.replicator.readiness();
    assert!(ready);
    assert_eq!(message, "ready");
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_unreachable_seeds_ends_standalone_ready() {
    let net = LoopbackNet::new();
    let node = spawn_node(&net, "node-a");

    // Loopback join reports zero reachable peers; the retry/backoff
    // sequence runs (virtual time) and the node continues standalone.
    node.replicator
        .bootstrap(&["10.255.0.1:7946".to_string()], Duration::from_secs(1))
        .await;

    assert!(node.replicator.readiness().0);
    let info = node.replicator.info().unwrap();
    assert_eq!(info.cluster_mode, "standalone");
}

// ============================================================
// CONVERGENCE
// ============================================================

#[tokio::test]
async fn test_two_nodes_converge_after_broadcast_exchange() {
    let net = LoopbackNet::new();
    let a = spawn_node(&net, "node-a");
    let b = spawn_node(&net, "node-b");

    // Writes land on both sides, replicated through broadcasts.
    let t1 = a.store.create("t-1", "from a").unwrap();
    a.replicator.broadcast_created(&t1).await;

    let t2 = b.store.create("t-2", "from b").unwrap();
    b.replicator.broadcast_created(&t2).await;

    wait_for("initial replication", || {
        a.store.count().unwrap() == 2 && b.store.count().unwrap() == 2
    })
    .await;

    // Concurrent-ish mutations on each side.
    let t1 = a.store.update_payload(t1.local_id, Some("v2"), None).unwrap();
    a.replicator.broadcast_updated(&t1).await;

    let t2b = b.store.get_by_extern_id("t-2").unwrap().unwrap();
    let t2b = b
        .store
        .update_payload(t2b.local_id, None, Some(true))
        .unwrap();
    b.replicator.broadcast_updated(&t2b).await;

    wait_for("update replication", || item_set(&a.store) == item_set(&b.store)).await;

    let expected: BTreeSet<(String, String, bool)> = [
        ("t-1".to_string(), "v2".to_string(), false),
        ("t-2".to_string(), "from b".to_string(), true),
    ]
    .into_iter()
    .collect();
    assert_eq!(item_set(&a.store), expected);
    assert_eq!(item_set(&b.store), expected);
}

#[tokio::test]
async fn test_partitioned_node_converges_after_heal() {
    let net = LoopbackNet::new();
    let a = spawn_node(&net, "node-a");
    let b = spawn_node(&net, "node-b");

    net.set_connected("node-b", false);

    // All of this happens while b is unreachable.
    let item = a.store.create("t-m", "a").unwrap();
    a.replicator.broadcast_created(&item).await;
    let item = a.store.update_payload(item.local_id, Some("b"), None).unwrap();
    a.replicator.broadcast_updated(&item).await;
    let item = a.store.update_payload(item.local_id, None, Some(true)).unwrap();
    a.replicator.broadcast_updated(&item).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.store.count().unwrap(), 0);

    // Heal: only the final update is re-broadcast (the network never
    // promised delivery of the earlier ones).
    net.set_connected("node-b", true);
    a.replicator.broadcast_updated(&item).await;

    wait_for("healed replication", || b.store.count().unwrap() == 1).await;
    let healed = b.store.get_by_extern_id("t-m").unwrap().unwrap();
    assert_eq!(healed.payload, "b");
    assert!(healed.done);
    assert_eq!(b.store.count().unwrap(), 1);
}

// ============================================================
// MEMBER FAILURE PLUMBING
// ============================================================

#[tokio::test]
async fn test_member_failed_reaches_reclaim_channel() {
    let net = LoopbackNet::new();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path().join("items.db")).unwrap());
    let (membership, events) = net.register("node-a");
    let (failed_tx, mut failed_rx) = mpsc::channel(16);
    let replicator = Replicator::new(
        store,
        membership,
        failed_tx,
        tokio_util::sync::CancellationToken::new(),
    );
    replicator.start(events);

    net.fail_node("node-b");

    let failed = timeout(Duration::from_secs(2), failed_rx.recv())
        .await
        .expect("no failure notification")
        .expect("channel closed");
    assert_eq!(failed, "node-b");
}
