use serde::{Deserialize, Serialize};

/// Processing lifecycle of an item's job slot.
///
/// `Pending` items are eligible for dispatch; `Claimed` and `Processing`
/// carry an owner (`claimer`) defended by heartbeats; `Completed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcState {
    Pending,
    Claimed,
    Processing,
    Completed,
    Failed,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Pending => "pending",
            ProcState::Claimed => "claimed",
            ProcState::Processing => "processing",
            ProcState::Completed => "completed",
            ProcState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ProcState> {
        match s {
            "pending" => Some(ProcState::Pending),
            "claimed" => Some(ProcState::Claimed),
            "processing" => Some(ProcState::Processing),
            "completed" => Some(ProcState::Completed),
            "failed" => Some(ProcState::Failed),
            _ => None,
        }
    }

    /// States in which a claim is held and must be backed by heartbeats.
    pub fn is_claimed(&self) -> bool {
        matches!(self, ProcState::Claimed | ProcState::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcState::Completed | ProcState::Failed)
    }
}

/// A replicated work item.
///
/// `local_id` is only meaningful on the node that assigned it; `extern_id`
/// is the cluster-wide replication key. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub local_id: i64,
    pub extern_id: String,
    pub payload: String,
    pub done: bool,
    pub created_at: i64,
    pub proc_state: ProcState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

/// Outcome accepted by `Store::finalise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

impl JobOutcome {
    pub fn proc_state(&self) -> ProcState {
        match self {
            JobOutcome::Completed => ProcState::Completed,
            JobOutcome::Failed => ProcState::Failed,
        }
    }
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
