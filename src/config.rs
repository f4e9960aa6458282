//! Runtime configuration for Custodian.
//!
//! Configuration is read from a TOML file (`--config`, or the
//! `CUSTODIAN_CONFIG` environment variable, or `custodian.toml` in the
//! working directory). Every section has working defaults so the binary
//! starts with no file at all; tests construct `Config::default()` directly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the SQLite state store. `:memory:` is honoured for ad-hoc use.
    pub database_path: PathBuf,
    /// Root directory for local file state: staged uploads, artifact store,
    /// log store, diff cache.
    pub state_dir: PathBuf,
    pub runner: RunnerConfig,
    pub publisher: PublisherConfig,
    pub differ: DifferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("custodian.db"),
            state_dir: PathBuf::from(".custodian"),
            runner: RunnerConfig::default(),
            publisher: PublisherConfig::default(),
            differ: DifferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub listen: String,
    /// Interval between watchdog sweeps; also the expected worker ping cadence.
    pub ping_interval_secs: u64,
    /// Heartbeat deadline. Defaults to 10x the ping interval when unset.
    pub keepalive_timeout_secs: Option<u64>,
    /// Slack added on top of `2 x estimated_duration` before a run is aborted.
    pub grace_secs: u64,
    /// Consecutive MIA sweeps after which a run is aborted.
    pub max_mia_sweeps: u32,
    /// Fallback duration estimate when a codebase has no run history.
    pub default_estimated_duration_secs: u64,
    /// Failure ratio above which a VCS host is skipped during assignment.
    pub host_failure_threshold: f64,
    /// Minimum recorded results before the threshold applies to a host.
    pub host_min_samples: usize,
    pub host_cooldown_secs: u64,
    /// How many queue candidates to try when an assignment races.
    pub assignment_retries: usize,
    /// Automatically re-enqueue transiently failed runs.
    pub retry_transient: bool,
}

impl RunnerConfig {
    pub fn keepalive_timeout_secs(&self) -> u64 {
        self.keepalive_timeout_secs
            .unwrap_or(self.ping_interval_secs * 10)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9911".to_string(),
            ping_interval_secs: 60,
            keepalive_timeout_secs: None,
            grace_secs: 600,
            max_mia_sweeps: 3,
            default_estimated_duration_secs: 900,
            host_failure_threshold: 0.5,
            host_min_samples: 5,
            host_cooldown_secs: 300,
            assignment_retries: 4,
            retry_transient: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    pub listen: String,
    /// Base URL of the VCS publish collaborator.
    pub vcs_url: String,
    /// Global cap on push/push-derived publishes per period.
    pub push_limit: u32,
    pub push_period_secs: u64,
    pub max_publishes_per_tick: usize,
    pub queue_loop_interval_secs: u64,
    pub scan_interval_secs: u64,
    /// Merge proposals not scanned for this long are stragglers.
    pub straggler_threshold_secs: u64,
    /// Open-proposal cap for rate-limit buckets without a policy override.
    pub default_max_open_mps: i64,
    /// When set, runs with publish_status `unknown` need review before publish.
    pub review_required: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9912".to_string(),
            vcs_url: "http://127.0.0.1:9920".to_string(),
            push_limit: 40,
            push_period_secs: 86_400,
            max_publishes_per_tick: 10,
            queue_loop_interval_secs: 60,
            scan_interval_secs: 3_600,
            straggler_threshold_secs: 7 * 86_400,
            default_max_open_mps: 10,
            review_required: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DifferConfig {
    pub listen: String,
    /// Address-space cap for diff tool children, in megabytes.
    pub memory_limit_mb: u64,
    /// CPU-time cap for diff tool children, in seconds.
    pub cpu_time_secs: u64,
    /// Wall-clock limit after which a diff tool child is killed.
    pub wall_clock_secs: u64,
    pub precache_concurrency: usize,
}

impl Default for DifferConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9913".to_string(),
            memory_limit_mb: 2048,
            cpu_time_secs: 600,
            wall_clock_secs: 900,
            precache_concurrency: 2,
        }
    }
}

impl Config {
    /// Load configuration, resolving the path in order: explicit argument,
    /// `CUSTODIAN_CONFIG`, `./custodian.toml`, built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved: Option<PathBuf> = match path {
            Some(p) => Some(p.to_path_buf()),
            None => match std::env::var_os("CUSTODIAN_CONFIG") {
                Some(p) => Some(PathBuf::from(p)),
                None => {
                    let default = PathBuf::from("custodian.toml");
                    default.exists().then_some(default)
                }
            },
        };

        match resolved {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.staging_dir())
            .context("Failed to create staging directory")?;
        std::fs::create_dir_all(self.artifact_dir())
            .context("Failed to create artifact directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.diff_cache_dir())
            .context("Failed to create diff cache directory")?;
        Ok(())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn diff_cache_dir(&self) -> PathBuf {
        self.state_dir.join("diff-cache")
    }
}
