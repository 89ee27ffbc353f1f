//! Local Item Store
//!
//! Each node owns a single-file SQLite database holding the replicated
//! `items` table. The store exposes the atomic primitives the rest of the
//! system is built on:
//!
//! - **CRUD**: create/get/list/update/delete keyed by local id or the
//!   cluster-wide `extern_id`.
//! - **Job coordination**: `claim_next` (serialisable FIFO claim),
//!   `mark_processing`, `heartbeat`, `finalise`, `release`.
//! - **Recovery queries**: `stale_claims` and `claims_of`, used by the
//!   stale sweep and by reclaim-on-peer-failure.
//!
//! Writes are plain transactions against the local file; replication to
//! peers happens above this layer and never reaches back into it.

pub mod model;
pub mod sqlite;

pub use model::{now_ms, Item, JobOutcome, ProcState};
pub use sqlite::{Store, StoreError};
