//! Integration tests for the Custodian control plane.
//!
//! Each scenario drives the real component states (runner, publisher,
//! differ) over one shared in-memory store and event bus, with a
//! recording fake standing in for the VCS publish collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use custodian::artifacts::LocalArtifactStore;
use custodian::bus::{EventBus, Topic};
use custodian::config::{DifferConfig, PublisherConfig, RunnerConfig};
use custodian::differ::cache::DiffCache;
use custodian::differ::{DifferState, SharedDiffer, compute, precache};
use custodian::errors::PublishError;
use custodian::publisher::vcs::{
    ProposalStatus, PublishOutcome, PublishRequest, VcsPublisher,
};
use custodian::publisher::{
    PublisherState, SharedPublisher, decision, proposals, sweep,
};
use custodian::runner::hosts::HostLimiter;
use custodian::runner::protocol::{AssignRequest, WorkerResult};
use custodian::runner::{RunnerState, SharedRunner, assign, ingest, queue, watchdog};
use custodian::state::models::*;
use custodian::state::{Db, StateDb, views};

// =============================================================================
// Fixtures
// =============================================================================

/// Records publish requests and serves scripted forge state.
#[derive(Default)]
struct RecordingVcs {
    requests: Mutex<Vec<PublishRequest>>,
    proposals: Mutex<HashMap<String, ProposalStatus>>,
    counter: Mutex<u64>,
}

impl RecordingVcs {
    fn set_proposal(&self, url: &str, status: ProposalStatus) {
        self.proposals
            .lock()
            .unwrap()
            .insert(url.to_string(), status);
    }
}

#[async_trait]
impl VcsPublisher for RecordingVcs {
    async fn publish_one(&self, req: &PublishRequest) -> Result<PublishOutcome, PublishError> {
        self.requests.lock().unwrap().push(req.clone());
        let proposal_url = if req.mode == PublishMode::Propose {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            let url = format!("https://forge.example/mp/{}", *counter);
            self.set_proposal(
                &url,
                ProposalStatus {
                    status: MergeProposalStatus::Open,
                    revision: Some(req.revision.clone()),
                    merged_by: None,
                    merged_at: None,
                    can_be_merged: Some(true),
                },
            );
            Some(url)
        } else {
            None
        };
        Ok(PublishOutcome {
            proposal_url,
            is_new: true,
            branch_name: format!("{}/{}", req.campaign, req.role),
            description: "published".into(),
        })
    }

    async fn proposal_status(&self, url: &str) -> Result<ProposalStatus, PublishError> {
        self.proposals
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| PublishError::NoRunForMp(url.to_string()))
    }

    async fn close_proposal(&self, url: &str, _comment: &str) -> Result<(), PublishError> {
        if let Some(state) = self.proposals.lock().unwrap().get_mut(url) {
            state.status = MergeProposalStatus::Closed;
        }
        Ok(())
    }
}

struct Plane {
    db: Db,
    bus: EventBus,
    runner: SharedRunner,
    publisher: SharedPublisher,
    differ: SharedDiffer,
    vcs: Arc<RecordingVcs>,
    _tmp: TempDir,
}

fn plane() -> Plane {
    let tmp = TempDir::new().unwrap();
    let db = Db::new(StateDb::new_in_memory().unwrap());
    let bus = EventBus::new(db.clone());
    let artifacts = Arc::new(LocalArtifactStore::new(
        tmp.path().join("artifacts"),
        tmp.path().join("logs"),
    ));
    let runner_config = RunnerConfig::default();
    let runner = Arc::new(RunnerState {
        db: db.clone(),
        bus: bus.clone(),
        artifacts: artifacts.clone(),
        hosts: Arc::new(HostLimiter::new(&runner_config)),
        config: runner_config,
        http: reqwest::Client::new(),
        staging_dir: tmp.path().join("staging"),
    });
    let vcs = Arc::new(RecordingVcs::default());
    let publisher = Arc::new(PublisherState::new(
        db.clone(),
        bus.clone(),
        vcs.clone(),
        PublisherConfig::default(),
    ));
    let differ = Arc::new(DifferState::new(
        db.clone(),
        bus.clone(),
        artifacts,
        DiffCache::new(tmp.path().join("diff-cache")),
        DifferConfig::default(),
    ));
    Plane {
        db,
        bus,
        runner,
        publisher,
        differ,
        vcs,
        _tmp: tmp,
    }
}

fn seed_codebase(db: &Db, name: &str) {
    let guard = db.lock_sync().unwrap();
    guard
        .upsert_codebase(&Codebase {
            name: name.to_string(),
            vcs_type: VcsType::Git,
            branch_url: format!("https://vcs.example/{name}"),
            subpath: None,
            web_url: None,
            value: 10,
            inactive: false,
        })
        .unwrap();
}

fn seed_candidate_with_policy(db: &Db, mode: PublishMode, max_open: Option<i64>) {
    let mut guard = db.lock_sync().unwrap();
    guard
        .upsert_candidate(&Candidate {
            id: 0,
            codebase: "foo".into(),
            campaign: "lintian-fixes".into(),
            change_set: None,
            command: "lintian-brush".into(),
            context: None,
            value: Some(50),
            success_chance: None,
            policy: "default".into(),
        })
        .unwrap();
    guard
        .put_policy(
            "default",
            &[PolicyRule {
                name: "default".into(),
                role: "main".into(),
                mode,
                frequency_days: None,
                rate_limit_bucket: Some("maintainer-x".into()),
                max_open_mps: max_open,
            }],
        )
        .unwrap();
}

fn success_result() -> WorkerResult {
    serde_json::from_value(serde_json::json!({
        "code": "success",
        "revision": "rev-b",
        "main_branch_revision": "rev-a",
        "branches": [["main", null, "rev-a", "rev-b"]],
    }))
    .unwrap()
}

async fn schedule_and_run_to_success(plane: &Plane) -> String {
    plane
        .db
        .call(|db| {
            queue::schedule(
                db,
                &queue::ScheduleRequest {
                    codebase: "foo".into(),
                    campaign: "lintian-fixes".into(),
                    command: None,
                    change_set: None,
                    offset: None,
                    bucket: None,
                    requester: None,
                    refresh: false,
                },
            )
            .map_err(|e| anyhow::anyhow!(e))
        })
        .await
        .unwrap();
    let assignment = assign::assign(&plane.runner, "worker-1".into(), AssignRequest::default())
        .await
        .unwrap();
    let log_id = assignment.id.unwrap();
    ingest::finish(&plane.runner, &log_id, success_result())
        .await
        .unwrap();
    log_id
}

// =============================================================================
// S1: normal success + push
// =============================================================================

mod normal_success_push {
    use super::*;

    #[tokio::test]
    async fn test_success_then_push_absorbs_branch() {
        let plane = plane();
        seed_codebase(&plane.db, "foo");
        seed_candidate_with_policy(&plane.db, PublishMode::Push, None);
        let mut rx = plane.bus.subscribe();

        let run_id = schedule_and_run_to_success(&plane).await;

        // run-finished was emitted after the durable persist.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, Topic::RunFinished);
        assert_eq!(event.payload["run_id"], run_id.as_str());
        assert_eq!(event.payload["result_code"], "success");

        // Lease/queue invariants: the queue row and the lease are gone, the
        // run exists.
        let guard = plane.db.lock_sync().unwrap();
        assert!(guard.list_queue().unwrap().is_empty());
        assert!(guard.list_active_runs().unwrap().is_empty());
        assert!(guard.get_run(&run_id).unwrap().is_some());
        drop(guard);

        // The publisher picks it up and pushes with no blockers.
        let published = sweep::process_queue_tick(&plane.publisher).await.unwrap();
        assert_eq!(published, 1);
        assert_eq!(plane.vcs.requests.lock().unwrap()[0].mode, PublishMode::Push);

        let guard = plane.db.lock_sync().unwrap();
        let publishes = guard.list_publishes("foo", "lintian-fixes").unwrap();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].result_code, "success");
        assert_eq!(publishes[0].mode, PublishMode::Push);
        assert!(guard.get_result_branches(&run_id).unwrap()[0].absorbed);
        // last_unabsorbed_run is now null for the pair.
        let view = views::last_run(guard.connection(), "foo", "lintian-fixes").unwrap();
        assert_eq!(view.last_effective_run_id.as_deref(), Some(run_id.as_str()));
        assert_eq!(view.last_unabsorbed_run_id, None);
    }
}

// =============================================================================
// S2: transient worker timeout, then retry succeeds
// =============================================================================

mod worker_timeout_retry {
    use super::*;

    #[tokio::test]
    async fn test_timeout_reschedules_and_retry_succeeds() {
        let plane = plane();
        seed_codebase(&plane.db, "foo");
        seed_candidate_with_policy(&plane.db, PublishMode::Push, None);

        plane
            .db
            .call(|db| {
                queue::schedule(
                    db,
                    &queue::ScheduleRequest {
                        codebase: "foo".into(),
                        campaign: "lintian-fixes".into(),
                        command: None,
                        change_set: None,
                        offset: None,
                        bucket: None,
                        requester: None,
                        refresh: false,
                    },
                )
                .map_err(|e| anyhow::anyhow!(e))
            })
            .await
            .unwrap();
        let assignment =
            assign::assign(&plane.runner, "worker-1".into(), AssignRequest::default())
                .await
                .unwrap();
        let first_id = assignment.id.unwrap();

        // No heartbeat ever arrives; backdate the lease past its deadline.
        {
            let guard = plane.db.lock_sync().unwrap();
            let stale = (Utc::now() - Duration::hours(2)).to_rfc3339();
            guard
                .connection()
                .execute(
                    "UPDATE active_run SET start_time = ?1, last_heartbeat = ?1,
                     estimated_duration_secs = 60",
                    rusqlite::params![stale],
                )
                .unwrap();
        }

        let report = watchdog::sweep(&plane.runner).await.unwrap();
        assert_eq!(report.aborted, 1);

        let guard = plane.db.lock_sync().unwrap();
        let timed_out = guard.get_run(&first_id).unwrap().unwrap();
        assert_eq!(timed_out.result_code, "worker-timeout");
        assert_eq!(timed_out.failure_transient, Some(true));
        // The transient failure was re-enqueued with refresh.
        let requeued = guard.list_queue().unwrap();
        assert_eq!(requeued.len(), 1);
        assert!(requeued[0].refresh);
        drop(guard);

        // The watchdog aborts precisely once.
        let report = watchdog::sweep(&plane.runner).await.unwrap();
        assert_eq!(report.aborted, 0);

        // The retry produces a normal success (S1 shape).
        let assignment =
            assign::assign(&plane.runner, "worker-2".into(), AssignRequest::default())
                .await
                .unwrap();
        assert!(assignment.resume_from.is_none());
        let retry_id = assignment.id.unwrap();
        ingest::finish(&plane.runner, &retry_id, success_result())
            .await
            .unwrap();

        let guard = plane.db.lock_sync().unwrap();
        let view = views::last_run(guard.connection(), "foo", "lintian-fixes").unwrap();
        assert_eq!(view.last_effective_run_id.as_deref(), Some(retry_id.as_str()));
    }
}

// =============================================================================
// S3: propose with rate limit
// =============================================================================

mod propose_rate_limit {
    use super::*;

    fn open_mp(db: &Db, url: &str) {
        let guard = db.lock_sync().unwrap();
        guard
            .upsert_merge_proposal(&MergeProposal {
                url: url.to_string(),
                codebase: Some("foo".into()),
                target_branch_url: None,
                status: MergeProposalStatus::Open,
                revision: None,
                merged_by: None,
                merged_at: None,
                last_scanned: None,
                can_be_merged: None,
                rate_limit_bucket: Some("maintainer-x".into()),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_bucket_cap_blocks_until_a_merge_frees_a_slot() {
        let plane = plane();
        seed_codebase(&plane.db, "foo");
        seed_candidate_with_policy(&plane.db, PublishMode::Propose, Some(2));
        let run_id = schedule_and_run_to_success(&plane).await;

        open_mp(&plane.db, "https://forge.example/existing/1");
        open_mp(&plane.db, "https://forge.example/existing/2");

        // Blocked: bucket is at its cap.
        let consideration = decision::consider_run(&plane.publisher, &run_id, None)
            .await
            .unwrap();
        assert!(!consideration.is_accepted());
        let blockers = consideration.blockers();
        assert_eq!(blockers["main"]["propose_rate_limit"]["result"], false);
        assert_eq!(blockers["main"]["propose_rate_limit"]["details"]["open"], 2);
        assert_eq!(
            blockers["main"]["propose_rate_limit"]["details"]["max_open"],
            2
        );
        assert_eq!(sweep::process_queue_tick(&plane.publisher).await.unwrap(), 0);
        {
            let guard = plane.db.lock_sync().unwrap();
            assert!(guard.list_publishes("foo", "lintian-fixes").unwrap().is_empty());
        }

        // One existing proposal merges; the next tick publishes.
        {
            let guard = plane.db.lock_sync().unwrap();
            let mut mp = guard
                .get_merge_proposal("https://forge.example/existing/1")
                .unwrap()
                .unwrap();
            mp.status = MergeProposalStatus::Merged;
            guard.upsert_merge_proposal(&mp).unwrap();
        }
        assert_eq!(sweep::process_queue_tick(&plane.publisher).await.unwrap(), 1);

        let guard = plane.db.lock_sync().unwrap();
        let created = guard
            .list_merge_proposals(Some("lintian-fixes"), None)
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].status, MergeProposalStatus::Open);
        assert_eq!(created[0].url, "https://forge.example/mp/1");
    }
}

// =============================================================================
// S4: backoff after failed proposes
// =============================================================================

mod backoff_after_failures {
    use super::*;

    #[tokio::test]
    async fn test_three_failures_wait_eight_hours_from_latest() {
        let plane = plane();
        seed_codebase(&plane.db, "foo");
        seed_candidate_with_policy(&plane.db, PublishMode::Propose, None);
        let run_id = schedule_and_run_to_success(&plane).await;

        // Failed attempts at T-10h, T-6h, T-1h.
        {
            let guard = plane.db.lock_sync().unwrap();
            for hours_ago in [10, 6, 1] {
                guard
                    .insert_publish(&custodian::state::db::NewPublish {
                        timestamp: Utc::now() - Duration::hours(hours_ago),
                        change_set: None,
                        codebase: "foo".into(),
                        campaign: "lintian-fixes".into(),
                        role: Some("main".into()),
                        mode: PublishMode::Propose,
                        source_branch_url: None,
                        target_branch_url: None,
                        revision: None,
                        merge_proposal_url: None,
                        result_code: "network-error".into(),
                        description: None,
                        requester: None,
                    })
                    .unwrap();
            }
        }

        let consideration = decision::consider_run(&plane.publisher, &run_id, None)
            .await
            .unwrap();
        assert!(!consideration.is_accepted());
        let blockers = consideration.blockers();
        assert_eq!(blockers["main"]["backoff"]["result"], false);
        assert_eq!(blockers["main"]["backoff"]["details"]["attempt_count"], 3);
        let next_try: chrono::DateTime<Utc> = blockers["main"]["backoff"]["details"]
            ["next_try_time"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        // min_wait = 2^3 h = 8h from T-1h, so roughly T+7h.
        let expected = Utc::now() + Duration::hours(7);
        assert!((next_try - expected).num_minutes().abs() < 5);
    }
}

// =============================================================================
// S5: differ coalescing
// =============================================================================

mod differ_coalescing {
    use super::*;

    /// Install a fake `diffoscope` on PATH that logs each invocation.
    fn install_fake_diffoscope(tmp: &TempDir) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let bin_dir = tmp.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let counter = tmp.path().join("invocations");
        let script = format!(
            "#!/bin/sh\necho run >> {}\nsleep 0.2\necho 'identical binaries'\nexit 0\n",
            counter.display()
        );
        let tool = bin_dir.join("diffoscope");
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        let old_path = std::env::var("PATH").unwrap_or_default();
        unsafe {
            std::env::set_var("PATH", format!("{}:{old_path}", bin_dir.display()));
        }
        counter
    }

    #[tokio::test]
    async fn test_concurrent_requests_run_one_tool_invocation() {
        let plane = plane();
        seed_codebase(&plane.db, "foo");
        let counter = install_fake_diffoscope(&plane._tmp);

        // Two runs with stored artifacts.
        {
            let mut guard = plane.db.lock_sync().unwrap();
            for id in ["old-run", "new-run"] {
                let run = Run {
                    id: id.into(),
                    codebase: "foo".into(),
                    campaign: "lintian-fixes".into(),
                    command: "cmd".into(),
                    start_time: Utc::now() - Duration::minutes(10),
                    finish_time: Utc::now(),
                    result_code: "success".into(),
                    failure_stage: None,
                    failure_transient: None,
                    description: None,
                    revision: Some("rev".into()),
                    main_branch_revision: None,
                    worker: None,
                    logfilenames: vec![],
                    result: None,
                    value: None,
                    publish_status: PublishStatus::Unknown,
                    resume_from: None,
                    change_set: None,
                };
                guard.record_run(&run, &[]).unwrap();
            }
        }
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("foo_1.0_amd64.deb"), b"bytes-a").unwrap();
        plane
            .differ
            .artifacts
            .store("old-run", src.path(), None)
            .await
            .unwrap();
        std::fs::write(src.path().join("foo_1.0_amd64.deb"), b"bytes-b").unwrap();
        plane
            .differ
            .artifacts
            .store("new-run", src.path(), None)
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            compute::get_diff(&plane.differ, compute::DiffKind::Diffoscope, "old-run", "new-run", false),
            compute::get_diff(&plane.differ, compute::DiffKind::Diffoscope, "old-run", "new-run", false),
        );
        let first = first.unwrap();
        let second = second.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, b"identical binaries\n");

        // Exactly one subprocess ran for the two concurrent callers.
        let invocations = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(invocations.lines().count(), 1);

        // A later request is served from cache with no new invocation.
        let third =
            compute::get_diff(&plane.differ, compute::DiffKind::Diffoscope, "old-run", "new-run", false)
                .await
                .unwrap();
        assert_eq!(third, first);
        let invocations = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(invocations.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_precache_pair_reports_cached_state() {
        let plane = plane();
        seed_codebase(&plane.db, "foo");
        {
            let mut guard = plane.db.lock_sync().unwrap();
            for (id, campaign) in [("ctrl", "control"), ("run", "lintian-fixes")] {
                let run = Run {
                    id: id.into(),
                    codebase: "foo".into(),
                    campaign: campaign.into(),
                    command: "cmd".into(),
                    start_time: Utc::now() - Duration::minutes(10),
                    finish_time: Utc::now(),
                    result_code: "success".into(),
                    failure_stage: None,
                    failure_transient: None,
                    description: None,
                    revision: Some("rev".into()),
                    main_branch_revision: None,
                    worker: None,
                    logfilenames: vec![],
                    result: None,
                    value: None,
                    publish_status: PublishStatus::Unknown,
                    resume_from: None,
                    change_set: None,
                };
                guard.record_run(&run, &[]).unwrap();
            }
        }
        for kind in [compute::DiffKind::Debdiff, compute::DiffKind::Diffoscope] {
            let key = custodian::differ::cache::cache_key(
                kind.tool(),
                kind.epoch(),
                "ctrl",
                "run",
                false,
            );
            plane.differ.cache.put(&key, b"cached").await.unwrap();
        }
        assert!(precache::precache_pair(&plane.differ, "ctrl", "run")
            .await
            .unwrap());
    }
}

// =============================================================================
// S6: merge proposal merged externally
// =============================================================================

mod merge_detected_by_scan {
    use super::*;

    #[tokio::test]
    async fn test_scan_absorbs_and_completes_change_set() {
        let plane = plane();
        seed_codebase(&plane.db, "foo");
        seed_candidate_with_policy(&plane.db, PublishMode::Propose, None);

        // Run inside a change set, then propose it.
        plane
            .db
            .call(|db| {
                queue::schedule(
                    db,
                    &queue::ScheduleRequest {
                        codebase: "foo".into(),
                        campaign: "lintian-fixes".into(),
                        command: None,
                        change_set: Some("cs-1".into()),
                        offset: None,
                        bucket: None,
                        requester: None,
                        refresh: false,
                    },
                )
                .map_err(|e| anyhow::anyhow!(e))
            })
            .await
            .unwrap();
        let assignment =
            assign::assign(&plane.runner, "worker-1".into(), AssignRequest::default())
                .await
                .unwrap();
        let run_id = assignment.id.unwrap();
        ingest::finish(&plane.runner, &run_id, success_result())
            .await
            .unwrap();
        assert_eq!(sweep::process_queue_tick(&plane.publisher).await.unwrap(), 1);

        let mp_url = {
            let guard = plane.db.lock_sync().unwrap();
            guard
                .list_merge_proposals(None, Some(MergeProposalStatus::Open))
                .unwrap()[0]
                .url
                .clone()
        };

        // The maintainer merges it on the forge.
        plane.vcs.set_proposal(
            &mp_url,
            ProposalStatus {
                status: MergeProposalStatus::Merged,
                revision: Some("rev-b".into()),
                merged_by: Some("alice".into()),
                merged_at: Some(Utc::now()),
                can_be_merged: None,
            },
        );
        let mut rx = plane.bus.subscribe();
        let report = proposals::scan(&plane.publisher).await.unwrap();
        assert_eq!(report.updated, 1);

        let guard = plane.db.lock_sync().unwrap();
        let mp = guard.get_merge_proposal(&mp_url).unwrap().unwrap();
        assert_eq!(mp.status, MergeProposalStatus::Merged);
        assert_eq!(mp.merged_by.as_deref(), Some("alice"));
        assert!(mp.merged_at.is_some());
        assert!(guard.get_result_branches(&run_id).unwrap()[0].absorbed);
        assert_eq!(
            guard.get_change_set("cs-1").unwrap().map(|cs| cs.state),
            Some(ChangeSetState::Done)
        );
        drop(guard);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, Topic::MergeProposalUpdated);
        assert_eq!(event.payload["status"], "merged");
    }
}
