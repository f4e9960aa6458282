//! Global atomic counters for control-plane observability.
//!
//! Counters are incremented silently at the call site; each component's
//! `GET /metrics` endpoint calls [`Metrics::render`] to produce Prometheus
//! text exposition.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters — no allocations, no locking.
pub struct Metrics {
    assignments: AtomicU64,
    empty_queue: AtomicU64,
    runs_finished: AtomicU64,
    runs_timed_out: AtomicU64,
    runs_killed: AtomicU64,
    publishes: AtomicU64,
    publish_failures: AtomicU64,
    proposals_scanned: AtomicU64,
    diff_cache_hits: AtomicU64,
    diff_cache_misses: AtomicU64,
    precached_pairs: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            assignments: AtomicU64::new(0),
            empty_queue: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
            runs_timed_out: AtomicU64::new(0),
            runs_killed: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            proposals_scanned: AtomicU64::new(0),
            diff_cache_hits: AtomicU64::new(0),
            diff_cache_misses: AtomicU64::new(0),
            precached_pairs: AtomicU64::new(0),
        }
    }

    pub fn inc_assignments(&self) {
        self.assignments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_empty_queue(&self) {
        self.empty_queue.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_finished(&self) {
        self.runs_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_timed_out(&self) {
        self.runs_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_killed(&self) {
        self.runs_killed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_publishes(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_publish_failures(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_proposals_scanned(&self) {
        self.proposals_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_diff_cache_hits(&self) {
        self.diff_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_diff_cache_misses(&self) {
        self.diff_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_precached_pairs(&self) {
        self.precached_pairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: &[(&str, &str, u64)] = &[
            (
                "custodian_assignments_total",
                "Queue items leased to workers",
                self.assignments.load(Ordering::Relaxed),
            ),
            (
                "custodian_empty_queue_total",
                "Assignment requests that found no eligible work",
                self.empty_queue.load(Ordering::Relaxed),
            ),
            (
                "custodian_runs_finished_total",
                "Worker results ingested",
                self.runs_finished.load(Ordering::Relaxed),
            ),
            (
                "custodian_runs_timed_out_total",
                "Active runs aborted by the watchdog",
                self.runs_timed_out.load(Ordering::Relaxed),
            ),
            (
                "custodian_runs_killed_total",
                "Active runs aborted on operator request",
                self.runs_killed.load(Ordering::Relaxed),
            ),
            (
                "custodian_publishes_total",
                "Successful publish operations",
                self.publishes.load(Ordering::Relaxed),
            ),
            (
                "custodian_publish_failures_total",
                "Failed publish operations",
                self.publish_failures.load(Ordering::Relaxed),
            ),
            (
                "custodian_proposals_scanned_total",
                "Merge proposal status refreshes",
                self.proposals_scanned.load(Ordering::Relaxed),
            ),
            (
                "custodian_diff_cache_hits_total",
                "Diff requests served from cache",
                self.diff_cache_hits.load(Ordering::Relaxed),
            ),
            (
                "custodian_diff_cache_misses_total",
                "Diff requests that ran a tool",
                self.diff_cache_misses.load(Ordering::Relaxed),
            ),
            (
                "custodian_precached_pairs_total",
                "Diff pairs precached from run-finished events",
                self.precached_pairs.load(Ordering::Relaxed),
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {value}\n"));
        }
        out
    }
}
