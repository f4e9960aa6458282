//! Runner — queue ownership, worker assignment, run supervision, ingestion.
//!
//! ## Overview
//!
//! The runner owns the pending work queue and the full lifecycle of a
//! leased run: it hands queue items to workers with exactly-once lease
//! semantics, watches their liveness over the declared backchannel, ingests
//! results into the state store, and announces finished runs on the bus.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP    ┌─────────────────────────────────────────────┐
//! │  Worker  │ ────────> │  api.rs   (axum Router, Basic auth)         │
//! └──────────┘           │     │                                       │
//!                        │     ├─ assign.rs   queue scan + lease       │
//!                        │     ├─ ingest.rs   finish + log staging     │
//!                        │     └─ queue.rs    schedule / positions     │
//!                        │                                             │
//!                        │  watchdog.rs  backchannel polls, deadlines, │
//!                        │               kill, timeout aborts          │
//!                        │  hosts.rs     per-host failure rate limiter │
//!                        │  protocol.rs  wire types (assignment/result)│
//!                        └─────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle of a queue item
//!
//! 1. `POST /runner/schedule` inserts into `queue` (one slot per
//!    codebase/campaign/change-set)
//! 2. `POST /runner/assign` deletes the queue row and creates the
//!    `active_run` lease in one transaction, minting a fresh log_id
//! 3. The watchdog polls the worker's backchannel each sweep; a silent or
//!    overdue run is aborted with result_code `worker-timeout`
//! 4. `PUT .../logs/{name}` stages files; `POST .../finish` persists the
//!    run, deletes the lease, and emits `runner.run-finished` after commit

pub mod api;
pub mod assign;
pub mod hosts;
pub mod ingest;
pub mod protocol;
pub mod queue;
pub mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;

use crate::artifacts::ArtifactStore;
use crate::bus::EventBus;
use crate::config::RunnerConfig;
use crate::state::Db;
use hosts::HostLimiter;

/// Shared state for the runner's HTTP handlers and sweep tasks.
pub struct RunnerState {
    pub db: Db,
    pub bus: EventBus,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub hosts: Arc<HostLimiter>,
    pub config: RunnerConfig,
    pub http: reqwest::Client,
    /// Per-run staging area for uploaded files, consumed at finish time.
    pub staging_dir: PathBuf,
}

pub type SharedRunner = Arc<RunnerState>;
