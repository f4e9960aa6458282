//! Per-host failure-rate limiting for assignments.
//!
//! The runner tracks recent build outcomes per VCS host. A host whose
//! failure ratio crosses the configured threshold is skipped (not removed)
//! during assignment until its cooldown elapses, so one flaky hosting
//! provider cannot monopolize the worker pool with doomed work.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RunnerConfig;

#[derive(Debug, Default)]
struct HostStats {
    /// Recent outcomes: (when, failed).
    events: VecDeque<(Instant, bool)>,
    cooldown_until: Option<Instant>,
}

pub struct HostLimiter {
    inner: Mutex<HashMap<String, HostStats>>,
    window: Duration,
    threshold: f64,
    min_samples: usize,
    cooldown: Duration,
}

impl HostLimiter {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            window: Duration::from_secs(config.host_cooldown_secs * 4),
            threshold: config.host_failure_threshold,
            min_samples: config.host_min_samples,
            cooldown: Duration::from_secs(config.host_cooldown_secs),
        }
    }

    pub fn record_result(&self, host: &str, failed: bool) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let now = Instant::now();
        let stats = inner.entry(host.to_string()).or_default();
        stats.events.push_back((now, failed));
        while let Some((when, _)) = stats.events.front() {
            if now.duration_since(*when) > self.window {
                stats.events.pop_front();
            } else {
                break;
            }
        }
        if stats.events.len() >= self.min_samples {
            let failures = stats.events.iter().filter(|(_, f)| *f).count();
            let ratio = failures as f64 / stats.events.len() as f64;
            if ratio > self.threshold {
                stats.cooldown_until = Some(now + self.cooldown);
                stats.events.clear();
            }
        }
    }

    pub fn is_limited(&self, host: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.get_mut(host) {
            Some(stats) => match stats.cooldown_until {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    stats.cooldown_until = None;
                    false
                }
                None => false,
            },
            None => false,
        }
    }
}

/// Authority component of a branch URL, e.g. `salsa.debian.org`.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r)?;
    let authority = rest.split(['/', '?', '#']).next()?;
    // Strip userinfo and port.
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = host.split_once(':').map_or(host, |(h, _)| h);
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}
