//! Event-driven precaching.
//!
//! Finished successful runs are paired with their baseline (the latest
//! successful control run for the codebase, else the previous success of
//! the same campaign) and both diff kinds are computed ahead of demand.
//! Concurrency is bounded by a semaphore; failures are logged and left
//! for the next on-demand request rather than retried.

use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::SharedDiffer;
use super::compute::{self, DiffKind};
use crate::bus::Topic;
use crate::errors::DifferError;
use crate::metrics::METRICS;
use crate::runner::queue::CONTROL_COMMAND;
use crate::state::StateDb;
use crate::state::models::Run;

/// Subscribe to `run-finished` and warm the cache for successful runs.
pub fn spawn_subscriber(state: SharedDiffer) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = state.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.topic != Topic::RunFinished
                        || event.payload["result_code"] != "success"
                    {
                        continue;
                    }
                    let Some(run_id) = event.payload["run_id"].as_str().map(String::from)
                    else {
                        continue;
                    };
                    let state = std::sync::Arc::clone(&state);
                    tokio::spawn(async move {
                        let Ok(_permit) = state.precache_sem.clone().acquire_owned().await
                        else {
                            return;
                        };
                        if let Err(err) = precache_for_run(&state, &run_id).await {
                            tracing::warn!(run_id = %run_id, error = %err, "precache failed");
                        }
                    });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // The durable event log covers the gap; precaching is
                    // best-effort anyway.
                    tracing::debug!(missed, "precache subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Precache the run against its baseline. No-op for runs without one.
pub async fn precache_for_run(state: &SharedDiffer, run_id: &str) -> Result<(), DifferError> {
    let id = run_id.to_string();
    let pair = state
        .db
        .call(move |db| {
            let Some(run) = db.get_run(&id)? else {
                return Ok(None);
            };
            Ok(baseline_for(db, &run)?.map(|baseline| (baseline, run.id)))
        })
        .await
        .map_err(DifferError::Other)?;
    let Some((old_id, new_id)) = pair else {
        return Ok(());
    };
    precache_pair(state, &old_id, &new_id).await?;
    Ok(())
}

/// Compute both diff kinds for a pair unless already cached. Returns true
/// when everything was cached before the call.
pub async fn precache_pair(
    state: &SharedDiffer,
    old_id: &str,
    new_id: &str,
) -> Result<bool, DifferError> {
    let mut was_cached = true;
    for kind in [DiffKind::Debdiff, DiffKind::Diffoscope] {
        let key = super::cache::cache_key(kind.tool(), kind.epoch(), old_id, new_id, false);
        if state.cache.contains(&key).await {
            continue;
        }
        was_cached = false;
        match compute::get_diff(state, kind, old_id, new_id, false).await {
            Ok(_) => {
                METRICS.inc_precached_pairs();
                state
                    .bus
                    .publish(
                        Topic::PrecacheDone,
                        serde_json::json!({
                            "event": "precache-done",
                            "old_id": old_id,
                            "new_id": new_id,
                            "kind": kind.tool(),
                        }),
                    )
                    .await;
            }
            Err(err) => {
                tracing::warn!(
                    old_id,
                    new_id,
                    kind = kind.tool(),
                    error = %err,
                    "precache compute failed"
                );
            }
        }
    }
    Ok(was_cached)
}

/// Schedule precaches for every codebase/campaign pair with an effective
/// successful run. Returns the number of pairs scheduled.
pub async fn precache_all(state: &SharedDiffer) -> Result<usize, DifferError> {
    let pairs: Vec<(String, String)> = state
        .db
        .call(|db| {
            let mut stmt = db.connection().prepare(
                "SELECT DISTINCT codebase, campaign FROM run
                 WHERE campaign != 'control' ORDER BY codebase, campaign",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut pairs = Vec::new();
            for row in rows {
                let (codebase, campaign): (String, String) = row?;
                let view =
                    crate::state::views::last_run(db.connection(), &codebase, &campaign)?;
                let Some(run_id) = view.last_effective_run_id else {
                    continue;
                };
                let Some(run) = db.get_run(&run_id)? else {
                    continue;
                };
                if run.result_code != "success" {
                    continue;
                }
                if let Some(baseline) = baseline_for(db, &run)? {
                    pairs.push((baseline, run.id));
                }
            }
            Ok(pairs)
        })
        .await
        .map_err(DifferError::Other)?;

    let scheduled = pairs.len();
    for (old_id, new_id) in pairs {
        let state = std::sync::Arc::clone(state);
        tokio::spawn(async move {
            let Ok(_permit) = state.precache_sem.clone().acquire_owned().await else {
                return;
            };
            if let Err(err) = precache_pair(&state, &old_id, &new_id).await {
                tracing::warn!(old_id, new_id, error = %err, "precache failed");
            }
        });
    }
    Ok(scheduled)
}

/// The comparison baseline for a run: the newest successful control run
/// of the codebase, else the previous success of the same campaign.
fn baseline_for(db: &StateDb, run: &Run) -> Result<Option<String>> {
    let control: Option<String> = db
        .connection()
        .query_row(
            "SELECT id FROM run
             WHERE codebase = ?1 AND campaign = ?2 AND result_code = 'success' AND id != ?3
             ORDER BY start_time DESC LIMIT 1",
            params![run.codebase, CONTROL_COMMAND, run.id],
            |row| row.get(0),
        )
        .optional()?;
    if control.is_some() {
        return Ok(control);
    }
    db.connection()
        .query_row(
            "SELECT id FROM run
             WHERE codebase = ?1 AND campaign = ?2 AND result_code = 'success'
               AND start_time < ?3 AND id != ?4
             ORDER BY start_time DESC LIMIT 1",
            params![
                run.codebase,
                run.campaign,
                run.start_time.to_rfc3339(),
                run.id
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::super::DifferState;
    use super::super::cache::{DiffCache, cache_key};
    use super::*;
    use crate::artifacts::LocalArtifactStore;
    use crate::bus::EventBus;
    use crate::config::DifferConfig;
    use crate::state::db::test_support::*;
    use crate::state::{Db, StateDb};
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fixture() -> (SharedDiffer, Db, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Db::new(StateDb::new_in_memory().unwrap());
        let state = Arc::new(DifferState::new(
            db.clone(),
            EventBus::new(db.clone()),
            Arc::new(LocalArtifactStore::new(
                tmp.path().join("artifacts"),
                tmp.path().join("logs"),
            )),
            DiffCache::new(tmp.path().join("cache")),
            DifferConfig::default(),
        ));
        (state, db, tmp)
    }

    #[test]
    fn test_baseline_prefers_control_run() -> Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        let mut control = successful_run("ctrl-1", "foo", "control");
        control.start_time = Utc::now() - Duration::hours(3);
        db.record_run(&control, &[])?;
        let mut earlier = successful_run("r1", "foo", "lintian-fixes");
        earlier.start_time = Utc::now() - Duration::hours(2);
        db.record_run(&earlier, &[])?;
        let run = successful_run("r2", "foo", "lintian-fixes");
        db.record_run(&run, &[])?;

        let baseline = baseline_for(&db, &db.get_run("r2")?.unwrap())?;
        assert_eq!(baseline.as_deref(), Some("ctrl-1"));
        Ok(())
    }

    #[test]
    fn test_baseline_falls_back_to_previous_success() -> Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        let mut earlier = successful_run("r1", "foo", "lintian-fixes");
        earlier.start_time = Utc::now() - Duration::hours(2);
        db.record_run(&earlier, &[])?;
        let run = successful_run("r2", "foo", "lintian-fixes");
        db.record_run(&run, &[])?;

        let baseline = baseline_for(&db, &db.get_run("r2")?.unwrap())?;
        assert_eq!(baseline.as_deref(), Some("r1"));

        // First run of a campaign has no baseline at all.
        let baseline = baseline_for(&db, &db.get_run("r1")?.unwrap())?;
        assert_eq!(baseline, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_precache_pair_is_noop_when_cached() -> Result<()> {
        let (state, db, _tmp) = fixture();
        {
            let mut guard = db.lock_sync()?;
            seed_codebase(&guard, "foo")?;
            guard.record_run(&successful_run("old", "foo", "control"), &[])?;
            guard.record_run(&successful_run("new", "foo", "lintian-fixes"), &[])?;
        }
        for tool in ["debdiff", "diffoscope"] {
            let key = cache_key(tool, "1", "old", "new", false);
            state.cache.put(&key, b"cached").await?;
        }
        let was_cached = precache_pair(&state, "old", "new").await.unwrap();
        assert!(was_cached);
        Ok(())
    }
}
