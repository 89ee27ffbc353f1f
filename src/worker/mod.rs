//! Job Worker
//!
//! The distributed executor side of the system. Every node runs exactly one
//! worker with a single job slot; cluster-wide mutual exclusion comes from
//! the store's atomic claim plus heartbeat defence, not from consensus:
//!
//! - **Dispatch** (1 s): claim the oldest pending item, walk it through
//!   claimed -> processing -> completed/failed, broadcasting each step.
//! - **Heartbeat** (5 s): a per-job background task refreshes the claim;
//!   losing ownership stops it.
//! - **Stale sweep** (30 s): claims silent for longer than the stale
//!   timeout are released back to pending, wherever they were held.
//! - **Reclaim on failure**: when a peer is declared dead its claims are
//!   released immediately instead of waiting for the sweep.

pub mod worker;

pub use worker::{simulated_work_handler, JobHandlerFn, Worker};
