//! Wire events exchanged between replicas.
//!
//! Two envelopes cover every broadcast: [`ItemEvent`] for data mutations
//! (these drive convergence) and [`JobEvent`] for processing lifecycle
//! transitions (observational only on remote nodes). Both ride user events
//! as JSON, so late joiners and steady-state peers share one code path.

use serde::{Deserialize, Serialize};

use crate::store::{now_ms, Item};

// Event names for item synchronization.
pub const EVENT_ITEM_CREATED: &str = "todo:created";
pub const EVENT_ITEM_UPDATED: &str = "todo:updated";
pub const EVENT_ITEM_DELETED: &str = "todo:deleted";

// Event names for job lifecycle observability.
pub const EVENT_JOB_CLAIMED: &str = "job:claimed";
pub const EVENT_JOB_STARTED: &str = "job:started";
pub const EVENT_JOB_HEARTBEAT: &str = "job:heartbeat";
pub const EVENT_JOB_COMPLETED: &str = "job:completed";
pub const EVENT_JOB_FAILED: &str = "job:failed";
pub const EVENT_JOB_RELEASED: &str = "job:released";

// Query names for cluster state transfer.
pub const QUERY_FULL_STATE: &str = "sync:full-state";
pub const QUERY_COUNT: &str = "sync:count";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemEventKind {
    Created,
    Updated,
    Deleted,
}

/// A replicated item mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEvent {
    #[serde(rename = "type")]
    pub kind: ItemEventKind,
    pub extern_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    pub origin_node: String,
    pub ts: i64,
}

impl ItemEvent {
    pub fn created(item: &Item, origin: &str) -> Self {
        Self {
            kind: ItemEventKind::Created,
            extern_id: item.extern_id.clone(),
            payload: Some(item.payload.clone()),
            done: Some(item.done),
            origin_node: origin.to_string(),
            ts: now_ms(),
        }
    }

    pub fn updated(item: &Item, origin: &str) -> Self {
        Self {
            kind: ItemEventKind::Updated,
            extern_id: item.extern_id.clone(),
            payload: Some(item.payload.clone()),
            done: Some(item.done),
            origin_node: origin.to_string(),
            ts: now_ms(),
        }
    }

    pub fn deleted(extern_id: &str, origin: &str) -> Self {
        Self {
            kind: ItemEventKind::Deleted,
            extern_id: extern_id.to_string(),
            payload: None,
            done: None,
            origin_node: origin.to_string(),
            ts: now_ms(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self.kind {
            ItemEventKind::Created => EVENT_ITEM_CREATED,
            ItemEventKind::Updated => EVENT_ITEM_UPDATED,
            ItemEventKind::Deleted => EVENT_ITEM_DELETED,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobEventKind {
    Claimed,
    Started,
    Heartbeat,
    Completed,
    Failed,
    Released,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Claimed => "claimed",
            JobEventKind::Started => "started",
            JobEventKind::Heartbeat => "heartbeat",
            JobEventKind::Completed => "completed",
            JobEventKind::Failed => "failed",
            JobEventKind::Released => "released",
        }
    }
}

/// A processing lifecycle transition, broadcast for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: JobEventKind,
    pub extern_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<i64>,
    pub origin_node: String,
    pub ts: i64,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, extern_id: &str, local_id: Option<i64>, origin: &str) -> Self {
        Self {
            kind,
            extern_id: extern_id.to_string(),
            local_id,
            origin_node: origin.to_string(),
            ts: now_ms(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self.kind {
            JobEventKind::Claimed => EVENT_JOB_CLAIMED,
            JobEventKind::Started => EVENT_JOB_STARTED,
            JobEventKind::Heartbeat => EVENT_JOB_HEARTBEAT,
            JobEventKind::Completed => EVENT_JOB_COMPLETED,
            JobEventKind::Failed => EVENT_JOB_FAILED,
            JobEventKind::Released => EVENT_JOB_RELEASED,
        }
    }
}

/// Acknowledgement payload for `sync:full-state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullStateAck {
    pub count: i64,
}

/// Response payload for `sync:count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: i64,
    pub node_id: String,
}
