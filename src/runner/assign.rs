//! Worker assignment: queue scan, eligibility filters, lease creation.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use super::hosts::{HostLimiter, host_of};
use super::protocol::{AssignRequest, Assignment, BranchInfo, ResumeFrom};
use super::SharedRunner;
use crate::errors::RunnerError;
use crate::metrics::METRICS;
use crate::state::models::{ActiveRun, Backchannel, Codebase, QueueItem};
use crate::state::{StateDb, views};

enum Outcome {
    Assigned(Box<Assignment>),
    Empty,
    Raced,
}

/// Lease the first eligible queue item to the calling worker.
///
/// Selection walks the queue in `(bucket, priority, id)` order, skipping
/// items the worker cannot serve and items on rate-limited hosts. The
/// queue-row delete and lease insert commit together; losing that race
/// moves on to the next eligible item.
pub async fn assign(
    state: &SharedRunner,
    worker: String,
    req: AssignRequest,
) -> Result<Assignment, RunnerError> {
    let hosts = Arc::clone(&state.hosts);
    let retries = state.config.assignment_retries;
    let default_duration = state.config.default_estimated_duration_secs as i64;

    let outcome = state
        .db
        .call(move |db| {
            let mut races = 0usize;
            let mut saw_eligible = false;
            let eligible: Vec<QueueItem> = eligible_items(db, &req, &hosts)?;
            for item in eligible {
                saw_eligible = true;
                let Some(codebase) = db.get_codebase(&item.codebase)? else {
                    continue;
                };
                let log_id = uuid::Uuid::new_v4().simple().to_string();
                let assignment =
                    build_assignment(db, &item, &codebase, Some(&log_id), default_duration)?;
                let lease = build_lease(&item, &codebase, &log_id, &worker, &req, &assignment);
                if db.claim_queue_item(item.id, &lease)? {
                    return Ok(Outcome::Assigned(Box::new(assignment)));
                }
                races += 1;
                if races >= retries {
                    return Ok(Outcome::Raced);
                }
            }
            Ok(if saw_eligible {
                Outcome::Raced
            } else {
                Outcome::Empty
            })
        })
        .await?;

    match outcome {
        Outcome::Assigned(assignment) => {
            METRICS.inc_assignments();
            tracing::info!(
                run_id = assignment.id.as_deref().unwrap_or(""),
                codebase = %assignment.codebase,
                campaign = %assignment.campaign,
                "assigned queue item"
            );
            Ok(*assignment)
        }
        Outcome::Empty => {
            METRICS.inc_empty_queue();
            Err(RunnerError::EmptyQueue)
        }
        Outcome::Raced => Err(RunnerError::AssignmentFailed),
    }
}

/// Same selection as [`assign`], without leasing. The returned envelope
/// carries no run id.
pub async fn peek(state: &SharedRunner, req: AssignRequest) -> Result<Assignment, RunnerError> {
    let hosts = Arc::clone(&state.hosts);
    let default_duration = state.config.default_estimated_duration_secs as i64;
    let found = state
        .db
        .call(move |db| {
            for item in eligible_items(db, &req, &hosts)? {
                let Some(codebase) = db.get_codebase(&item.codebase)? else {
                    continue;
                };
                return Ok(Some(build_assignment(
                    db,
                    &item,
                    &codebase,
                    None,
                    default_duration,
                )?));
            }
            Ok(None)
        })
        .await?;
    found.ok_or(RunnerError::EmptyQueue)
}

fn eligible_items(
    db: &StateDb,
    req: &AssignRequest,
    hosts: &HostLimiter,
) -> Result<Vec<QueueItem>> {
    let mut items = Vec::new();
    for item in db.list_queue()? {
        if let Some(campaign) = &req.campaign {
            if &item.campaign != campaign {
                continue;
            }
        }
        if let Some(codebase) = &req.codebase {
            if &item.codebase != codebase {
                continue;
            }
        }
        let Some(cb) = db.get_codebase(&item.codebase)? else {
            continue;
        };
        if cb.inactive {
            continue;
        }
        if let Some(host) = host_of(&cb.branch_url) {
            if hosts.is_limited(&host) {
                continue;
            }
        }
        items.push(item);
    }
    Ok(items)
}

fn build_assignment(
    db: &StateDb,
    item: &QueueItem,
    codebase: &Codebase,
    log_id: Option<&str>,
    default_duration: i64,
) -> Result<Assignment> {
    // refresh discards the resume baseline; the worker starts from scratch.
    let resume_from = if item.refresh {
        None
    } else {
        resume_baseline(db, &item.codebase, &item.campaign)?
    };
    let estimated = item
        .estimated_duration_secs
        .or(db.estimate_duration(&item.codebase, &item.campaign)?)
        .unwrap_or(default_duration);
    Ok(Assignment {
        id: log_id.map(String::from),
        codebase: item.codebase.clone(),
        campaign: item.campaign.clone(),
        command: item.command.clone(),
        description: format!("{} on {}", item.campaign, item.codebase),
        queue_id: item.id,
        estimated_duration_seconds: estimated,
        branch: BranchInfo {
            url: codebase.branch_url.clone(),
            vcs_type: codebase.vcs_type.as_str().to_string(),
            subpath: codebase.subpath.clone(),
            cached_url: None,
        },
        resume_from,
        build: serde_json::json!({
            "campaign": item.campaign,
            "codebase": item.codebase,
        }),
        force_build: false,
        skip_setup_validation: false,
        default_empty: false,
    })
}

/// The run whose branches a worker may continue from: the effective last
/// run with unabsorbed results, if any.
fn resume_baseline(db: &StateDb, codebase: &str, campaign: &str) -> Result<Option<ResumeFrom>> {
    let view = views::last_run(db.connection(), codebase, campaign)?;
    let Some(run_id) = view.last_unabsorbed_run_id else {
        return Ok(None);
    };
    let Some(run) = db.get_run(&run_id)? else {
        return Ok(None);
    };
    Ok(Some(ResumeFrom {
        run_id,
        branch_url: None,
        revision: run.revision,
    }))
}

fn build_lease(
    item: &QueueItem,
    codebase: &Codebase,
    log_id: &str,
    worker: &str,
    req: &AssignRequest,
    assignment: &Assignment,
) -> ActiveRun {
    let backchannel = match (&req.my_url, &req.jenkins_build_url) {
        (Some(my_url), _) => Some(Backchannel::Polling {
            my_url: my_url.clone(),
        }),
        (None, Some(build_url)) => Some(Backchannel::Jenkins {
            build_url: build_url.clone(),
        }),
        (None, None) => None,
    };
    let now = Utc::now();
    ActiveRun {
        log_id: log_id.to_string(),
        queue_id: item.id,
        codebase: item.codebase.clone(),
        campaign: item.campaign.clone(),
        command: item.command.clone(),
        worker: worker.to_string(),
        backchannel,
        start_time: now,
        estimated_duration_secs: assignment.estimated_duration_seconds,
        last_heartbeat: now,
        mia_count: 0,
        vcs_info: serde_json::json!({
            "vcs_type": codebase.vcs_type.as_str(),
            "branch_url": codebase.branch_url,
            "subpath": codebase.subpath,
        }),
        change_set: item.change_set.clone(),
        resume_from: assignment.resume_from.as_ref().map(|r| r.run_id.clone()),
        refresh: item.refresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::LocalArtifactStore;
    use crate::bus::EventBus;
    use crate::config::RunnerConfig;
    use crate::runner::RunnerState;
    use crate::state::db::test_support::*;
    use crate::state::models::QueueBucket;
    use crate::state::{Db, StateDb};

    fn runner_state(db: Db) -> SharedRunner {
        let config = RunnerConfig::default();
        let tmp = std::env::temp_dir().join("custodian-assign-tests");
        Arc::new(RunnerState {
            bus: EventBus::new(db.clone()),
            db,
            artifacts: Arc::new(LocalArtifactStore::new(
                tmp.join("artifacts"),
                tmp.join("logs"),
            )),
            hosts: Arc::new(HostLimiter::new(&config)),
            config,
            http: reqwest::Client::new(),
            staging_dir: tmp.join("staging"),
        })
    }

    fn seed_queue(db: &Db, codebase: &str, campaign: &str) -> i64 {
        let guard = db.lock_sync().unwrap();
        seed_codebase(&guard, codebase).unwrap();
        guard
            .insert_queue_item(
                codebase,
                campaign,
                "cmd",
                0,
                QueueBucket::Default,
                Some(600),
                None,
                None,
                false,
            )
            .unwrap()
            .expect("slot free")
            .id
    }

    #[tokio::test]
    async fn test_assign_leases_and_returns_envelope() -> Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let state = runner_state(db.clone());
        let queue_id = seed_queue(&db, "foo", "lintian-fixes");

        let assignment = assign(
            &state,
            "worker-1".into(),
            AssignRequest {
                my_url: Some("http://worker-1:8080".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(assignment.queue_id, queue_id);
        assert_eq!(assignment.codebase, "foo");
        assert_eq!(assignment.branch.vcs_type, "git");
        let log_id = assignment.id.expect("leased runs carry an id");

        let guard = db.lock_sync()?;
        assert!(guard.get_queue_item(queue_id)?.is_none());
        let lease = guard.get_active_run(&log_id)?.expect("lease exists");
        assert_eq!(lease.worker, "worker-1");
        assert_eq!(
            lease.backchannel,
            Some(Backchannel::Polling {
                my_url: "http://worker-1:8080".into()
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_assign_empty_queue() -> Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let state = runner_state(db);
        let err = assign(&state, "worker-1".into(), AssignRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::EmptyQueue));
        Ok(())
    }

    #[tokio::test]
    async fn test_assign_respects_campaign_filter() -> Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let state = runner_state(db.clone());
        seed_queue(&db, "foo", "lintian-fixes");

        let err = assign(
            &state,
            "worker-1".into(),
            AssignRequest {
                campaign: Some("fresh-snapshots".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunnerError::EmptyQueue));
        Ok(())
    }

    #[tokio::test]
    async fn test_peek_does_not_lease() -> Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let state = runner_state(db.clone());
        let queue_id = seed_queue(&db, "foo", "lintian-fixes");

        let envelope = peek(&state, AssignRequest::default()).await.unwrap();
        assert!(envelope.id.is_none());
        assert_eq!(envelope.queue_id, queue_id);

        let guard = db.lock_sync()?;
        assert!(guard.get_queue_item(queue_id)?.is_some());
        assert!(guard.list_active_runs()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_item_omits_resume_baseline() -> Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let state = runner_state(db.clone());
        {
            let mut guard = db.lock_sync()?;
            seed_codebase(&guard, "foo")?;
            // A prior success with an unabsorbed branch is a resume baseline.
            let run = successful_run("r1", "foo", "lintian-fixes");
            guard.record_run(
                &run,
                &[crate::state::models::ResultBranch {
                    run_id: "r1".into(),
                    role: "main".into(),
                    remote_name: None,
                    base_revision: None,
                    revision: Some("rev-b".into()),
                    absorbed: false,
                }],
            )?;
            guard
                .insert_queue_item(
                    "foo",
                    "lintian-fixes",
                    "cmd",
                    0,
                    QueueBucket::Default,
                    None,
                    None,
                    None,
                    true,
                )?
                .expect("slot free");
        }
        let assignment = assign(&state, "worker-1".into(), AssignRequest::default())
            .await
            .unwrap();
        assert!(assignment.resume_from.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_non_refresh_item_resumes_from_unabsorbed_run() -> Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let state = runner_state(db.clone());
        {
            let mut guard = db.lock_sync()?;
            seed_codebase(&guard, "foo")?;
            let run = successful_run("r1", "foo", "lintian-fixes");
            guard.record_run(
                &run,
                &[crate::state::models::ResultBranch {
                    run_id: "r1".into(),
                    role: "main".into(),
                    remote_name: None,
                    base_revision: None,
                    revision: Some("rev-b".into()),
                    absorbed: false,
                }],
            )?;
            guard
                .insert_queue_item(
                    "foo",
                    "lintian-fixes",
                    "cmd",
                    0,
                    QueueBucket::Default,
                    None,
                    None,
                    None,
                    false,
                )?
                .expect("slot free");
        }
        let assignment = assign(&state, "worker-1".into(), AssignRequest::default())
            .await
            .unwrap();
        let resume = assignment.resume_from.expect("baseline present");
        assert_eq!(resume.run_id, "r1");
        assert_eq!(resume.revision.as_deref(), Some("rev-b"));
        Ok(())
    }

    #[tokio::test]
    async fn test_rate_limited_host_is_skipped() -> Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let state = runner_state(db.clone());
        seed_queue(&db, "foo", "lintian-fixes");
        // Push the codebase's host over the failure threshold.
        for _ in 0..10 {
            state.hosts.record_result("vcs.example", true);
        }
        let err = assign(&state, "worker-1".into(), AssignRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::EmptyQueue));
        Ok(())
    }
}
