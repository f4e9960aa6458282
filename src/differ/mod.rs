//! Differ — on-demand artifact comparison with coalesced builds.
//!
//! ## Overview
//!
//! The differ serves `debdiff` and `diffoscope` output between two runs'
//! artifacts. Results are cached by a key covering the tool, inputs, and
//! filter flags; concurrent requests for the same key coalesce onto a
//! single tool invocation. A precache pipeline listens for finished runs
//! and warms the cache against their baselines before anyone asks.
//!
//! ## Module Map
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `cache`    | content-addressed on-disk result cache                    |
//! | `compute`  | single-flight tool execution with resource caps           |
//! | `precache` | run-finished subscriber + bounded precache pool           |
//! | `api`      | axum Router, Accept-header content negotiation            |

pub mod api;
pub mod cache;
pub mod compute;
pub mod precache;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::artifacts::ArtifactStore;
use crate::bus::EventBus;
use crate::config::DifferConfig;
use crate::state::Db;
use cache::DiffCache;

/// Shared state for the differ's HTTP handlers and the precache pool.
pub struct DifferState {
    pub db: Db,
    pub bus: EventBus,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub cache: DiffCache,
    pub config: DifferConfig,
    /// Single-flight locks, one per cache key.
    inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub precache_sem: Arc<Semaphore>,
}

pub type SharedDiffer = Arc<DifferState>;

impl DifferState {
    pub fn new(
        db: Db,
        bus: EventBus,
        artifacts: Arc<dyn ArtifactStore>,
        cache: DiffCache,
        config: DifferConfig,
    ) -> Self {
        let precache_sem = Arc::new(Semaphore::new(config.precache_concurrency.max(1)));
        Self {
            db,
            bus,
            artifacts,
            cache,
            config,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            precache_sem,
        }
    }

    pub async fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        Arc::clone(inflight.entry(key.to_string()).or_default())
    }
}
