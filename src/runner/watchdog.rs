//! Liveness supervision for active runs.
//!
//! Each sweep polls every lease's backchannel, refreshes heartbeats, and
//! aborts runs that are overdue (`2 x estimated_duration + grace`) or have
//! been missing-in-action for too many consecutive sweeps. Aborts go
//! through the same persist path as worker results, so a reaped run looks
//! exactly like any other finished run downstream.

use std::time::Duration;

use chrono::Utc;

use super::SharedRunner;
use super::ingest;
use crate::errors::RunnerError;
use crate::metrics::METRICS;
use crate::state::models::{ActiveRun, Backchannel, Run, result_code};

const BACKCHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub aborted: usize,
}

/// Spawn the periodic watchdog task.
pub fn spawn(state: SharedRunner) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(state.config.ping_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match sweep(&state).await {
                Ok(report) if report.aborted > 0 => {
                    tracing::info!(
                        checked = report.checked,
                        aborted = report.aborted,
                        "watchdog sweep reaped runs"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "watchdog sweep failed"),
            }
        }
    })
}

/// One supervision pass over all active runs.
pub async fn sweep(state: &SharedRunner) -> Result<SweepReport, RunnerError> {
    let active = state.db.call(|db| db.list_active_runs()).await?;
    let now = Utc::now();
    let keepalive = chrono::Duration::seconds(state.config.keepalive_timeout_secs() as i64);
    let grace = state.config.grace_secs as i64;

    let mut report = SweepReport::default();
    for run in active {
        report.checked += 1;

        let mut last_heartbeat = run.last_heartbeat;
        if let Some(backchannel) = &run.backchannel {
            if poll_backchannel(&state.http, backchannel).await {
                let id = run.log_id.clone();
                let _ = state
                    .db
                    .call(move |db| db.record_heartbeat(&id, Utc::now()))
                    .await;
                last_heartbeat = now;
            }
        }

        let stale = now - last_heartbeat > keepalive;
        let mia_count = if stale {
            let id = run.log_id.clone();
            state
                .db
                .call(move |db| db.increment_mia(&id))
                .await
                .unwrap_or(run.mia_count + 1)
        } else {
            0
        };

        let deadline = run.start_time
            + chrono::Duration::seconds(2 * run.estimated_duration_secs + grace);
        let overdue = now > deadline;
        if overdue || mia_count >= state.config.max_mia_sweeps as i64 {
            let reason = if overdue {
                format!(
                    "no result after {}s (estimated {}s)",
                    (now - run.start_time).num_seconds(),
                    run.estimated_duration_secs
                )
            } else {
                format!("worker unreachable for {mia_count} sweeps")
            };
            if ingest::abort_run(state, &run.log_id, result_code::WORKER_TIMEOUT, &reason, true)
                .await?
                .is_some()
            {
                METRICS.inc_runs_timed_out();
                record_host_failure(state, &run).await;
                report.aborted += 1;
            }
        }
    }
    Ok(report)
}

/// Abort a run on operator request. Notifies the worker over its
/// backchannel best-effort; the lease is reaped regardless.
pub async fn kill(state: &SharedRunner, run_id: &str) -> Result<Run, RunnerError> {
    let id = run_id.to_string();
    let active = state
        .db
        .call(move |db| db.get_active_run(&id))
        .await?
        .ok_or_else(|| RunnerError::UnknownRun(run_id.to_string()))?;

    if let Some(backchannel) = &active.backchannel {
        notify_kill(&state.http, backchannel).await;
    }
    let run = ingest::abort_run(state, run_id, result_code::KILLED, "killed by operator", false)
        .await?
        .ok_or_else(|| RunnerError::UnknownRun(run_id.to_string()))?;
    METRICS.inc_runs_killed();
    Ok(run)
}

async fn poll_backchannel(http: &reqwest::Client, backchannel: &Backchannel) -> bool {
    let url = match backchannel {
        Backchannel::Polling { my_url } => my_url.clone(),
        Backchannel::Jenkins { build_url } => {
            format!("{}/api/json", build_url.trim_end_matches('/'))
        }
    };
    match http
        .get(&url)
        .timeout(BACKCHANNEL_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

async fn notify_kill(http: &reqwest::Client, backchannel: &Backchannel) {
    let url = match backchannel {
        Backchannel::Polling { my_url } => format!("{}/kill", my_url.trim_end_matches('/')),
        Backchannel::Jenkins { build_url } => {
            format!("{}/stop", build_url.trim_end_matches('/'))
        }
    };
    if let Err(err) = http
        .post(&url)
        .timeout(BACKCHANNEL_TIMEOUT)
        .send()
        .await
    {
        tracing::debug!(url = %url, error = %err, "kill notification failed");
    }
}

async fn record_host_failure(state: &SharedRunner, run: &ActiveRun) {
    let codebase = run.codebase.clone();
    if let Ok(Some(cb)) = state.db.call(move |db| db.get_codebase(&codebase)).await {
        if let Some(host) = super::hosts::host_of(&cb.branch_url) {
            state.hosts.record_result(&host, true);
        }
    }
}
