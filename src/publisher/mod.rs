//! Publisher — turns successful runs into upstream changes.
//!
//! ## Overview
//!
//! The publisher consumes `run-finished` events and the `publish_ready`
//! view, decides per run whether publishing is allowed (the ten-step check
//! chain in `decision.rs`), executes the VCS-level publish through the
//! collaborator interface in `vcs.rs`, and then owns the merge-proposal
//! lifecycle until every result branch is absorbed upstream.
//!
//! ## Module Map
//!
//! | Module      | Responsibility                                           |
//! |-------------|----------------------------------------------------------|
//! | `decision`  | `consider_publish_run` check chain, blockers, backoff    |
//! | `vcs`       | `VcsPublisher` trait + HTTP collaborator client          |
//! | `sweep`     | publish execution, queue loop, per-target locks          |
//! | `proposals` | MP scanning, stragglers, abandon / close-applied         |
//! | `ratelimit` | per-bucket open-proposal accounting                      |
//! | `api`       | axum Router + admin endpoints                            |
//!
//! Publishing is strictly idempotent: every attempt is recorded as a
//! `publish` row, success flips the result branch to absorbed, and repeat
//! deliveries of the same event converge on the same rows.

pub mod api;
pub mod decision;
pub mod proposals;
pub mod ratelimit;
pub mod sweep;
pub mod vcs;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::bus::EventBus;
use crate::config::PublisherConfig;
use crate::state::Db;
use vcs::VcsPublisher;

/// Shared state for the publisher's HTTP handlers and sweep tasks.
pub struct PublisherState {
    pub db: Db,
    pub bus: EventBus,
    pub vcs: Arc<dyn VcsPublisher>,
    pub config: PublisherConfig,
    /// One publish at a time per (codebase, campaign).
    target_locks: tokio::sync::Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
    /// One status refresh at a time per proposal URL.
    scan_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Forge hosts currently signalling rate-limited / branch-busy.
    forge_limits: Mutex<HashMap<String, DateTime<Utc>>>,
}

pub type SharedPublisher = Arc<PublisherState>;

impl PublisherState {
    pub fn new(
        db: Db,
        bus: EventBus,
        vcs: Arc<dyn VcsPublisher>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            db,
            bus,
            vcs,
            config,
            target_locks: tokio::sync::Mutex::new(HashMap::new()),
            scan_locks: tokio::sync::Mutex::new(HashMap::new()),
            forge_limits: Mutex::new(HashMap::new()),
        }
    }

    pub async fn target_lock(
        &self,
        codebase: &str,
        campaign: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.target_locks.lock().await;
        Arc::clone(
            locks
                .entry((codebase.to_string(), campaign.to_string()))
                .or_default(),
        )
    }

    pub async fn scan_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.scan_locks.lock().await;
        Arc::clone(locks.entry(url.to_string()).or_default())
    }

    /// Transient forge pressure on a host; publishes to it block until
    /// `until` passes.
    pub fn note_forge_limit(&self, host: &str, until: DateTime<Utc>) {
        if let Ok(mut limits) = self.forge_limits.lock() {
            limits.insert(host.to_string(), until);
        }
    }

    pub fn forge_retry_after(&self, host: &str) -> Option<DateTime<Utc>> {
        let mut limits = self.forge_limits.lock().ok()?;
        match limits.get(host) {
            Some(until) if *until > Utc::now() => Some(*until),
            Some(_) => {
                limits.remove(host);
                None
            }
            None => None,
        }
    }
}
