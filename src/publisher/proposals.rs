//! Merge-proposal lifecycle tracking.
//!
//! A proposal row is created when a propose publish succeeds and is then
//! kept in sync with the forge by periodic scans. Merging absorbs the
//! originating result branch; abandoning or applying closes the proposal
//! without touching absorption.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Serialize;

use super::SharedPublisher;
use crate::bus::Topic;
use crate::errors::PublishError;
use crate::metrics::METRICS;
use crate::state::models::{MergeProposal, MergeProposalStatus};
use crate::state::views;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub updated: usize,
}

/// Refresh forge state for open proposals plus the oldest-scanned ones.
pub async fn scan(state: &SharedPublisher) -> Result<ScanReport, PublishError> {
    let stale_before =
        Utc::now() - Duration::seconds(state.config.straggler_threshold_secs as i64);
    let proposals = state
        .db
        .call(move |db| db.merge_proposals_to_scan(stale_before))
        .await?;

    let mut report = ScanReport::default();
    for mp in proposals {
        report.scanned += 1;
        match refresh_proposal(state, &mp.url).await {
            Ok(true) => report.updated += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(url = %mp.url, error = %err, "proposal refresh failed");
            }
        }
    }
    Ok(report)
}

/// Rescan proposals whose last scan is older than the stale threshold.
pub async fn check_stragglers(state: &SharedPublisher) -> Result<usize, PublishError> {
    let stale_before =
        Utc::now() - Duration::seconds(state.config.straggler_threshold_secs as i64);
    let proposals = state
        .db
        .call(move |db| db.merge_proposals_to_scan(stale_before))
        .await?;
    let mut checked = 0usize;
    for mp in proposals {
        let is_straggler = mp.last_scanned.is_none_or(|t| t < stale_before);
        if !is_straggler {
            continue;
        }
        checked += 1;
        if let Err(err) = refresh_proposal(state, &mp.url).await {
            tracing::warn!(url = %mp.url, error = %err, "straggler refresh failed");
        }
    }
    Ok(checked)
}

/// Fetch forge state for one proposal and apply it. Returns true when the
/// stored status changed. At most one refresh runs per URL at a time.
pub async fn refresh_proposal(state: &SharedPublisher, url: &str) -> Result<bool, PublishError> {
    let lock = state.scan_lock(url).await;
    let _guard = lock.lock().await;

    let url_owned = url.to_string();
    let current = state
        .db
        .call(move |db| db.get_merge_proposal(&url_owned))
        .await?
        .ok_or_else(|| PublishError::NoRunForMp(url.to_string()))?;

    let forge = state.vcs.proposal_status(url).await?;
    METRICS.inc_proposals_scanned();

    let updated = MergeProposal {
        url: current.url.clone(),
        codebase: current.codebase.clone(),
        target_branch_url: current.target_branch_url.clone(),
        status: forge.status,
        revision: forge.revision.clone().or(current.revision.clone()),
        merged_by: forge.merged_by.clone().or(current.merged_by.clone()),
        merged_at: forge.merged_at.or(current.merged_at),
        last_scanned: Some(Utc::now()),
        can_be_merged: forge.can_be_merged.or(current.can_be_merged),
        rate_limit_bucket: current.rate_limit_bucket.clone(),
    };
    apply_state(state, &current, updated).await
}

/// Post a comment, close the proposal on the forge, and record it as
/// abandoned. Absorption is untouched: the change never landed.
pub async fn abandon_mp(
    state: &SharedPublisher,
    url: &str,
    reason: &str,
) -> Result<(), PublishError> {
    close_with_status(state, url, reason, MergeProposalStatus::Abandoned).await
}

/// Close a proposal whose change reached upstream through other means.
pub async fn close_applied_mp(state: &SharedPublisher, url: &str) -> Result<(), PublishError> {
    close_with_status(
        state,
        url,
        "This change has been applied through other channels; closing.",
        MergeProposalStatus::Applied,
    )
    .await
}

async fn close_with_status(
    state: &SharedPublisher,
    url: &str,
    comment: &str,
    status: MergeProposalStatus,
) -> Result<(), PublishError> {
    let lock = state.scan_lock(url).await;
    let _guard = lock.lock().await;

    let url_owned = url.to_string();
    let current = state
        .db
        .call(move |db| db.get_merge_proposal(&url_owned))
        .await?
        .ok_or_else(|| PublishError::NoRunForMp(url.to_string()))?;

    state.vcs.close_proposal(url, comment).await?;
    let mut updated = current.clone();
    updated.status = status;
    updated.last_scanned = Some(Utc::now());
    apply_state(state, &current, updated).await?;
    Ok(())
}

/// Admin override of a proposal's stored status. Goes through the same
/// apply path as a forge scan, so a merged override absorbs normally.
pub async fn override_status(
    state: &SharedPublisher,
    url: &str,
    status: MergeProposalStatus,
) -> Result<bool, PublishError> {
    let url_owned = url.to_string();
    let current = state
        .db
        .call(move |db| db.get_merge_proposal(&url_owned))
        .await?
        .ok_or_else(|| PublishError::NoRunForMp(url.to_string()))?;
    let mut updated = current.clone();
    updated.status = status;
    if status == MergeProposalStatus::Merged && updated.merged_at.is_none() {
        updated.merged_at = Some(Utc::now());
    }
    apply_state(state, &current, updated).await
}

/// Persist a proposal transition, run absorption for merges, and emit
/// `merge-proposal-updated` when the status changed. Applying the same
/// forge state twice converges on identical rows.
async fn apply_state(
    state: &SharedPublisher,
    before: &MergeProposal,
    after: MergeProposal,
) -> Result<bool, PublishError> {
    let status_changed = before.status != after.status;
    let after_c = after.clone();
    state
        .db
        .call(move |db| db.upsert_merge_proposal(&after_c))
        .await?;

    if after.status == MergeProposalStatus::Merged {
        absorb_for_mp(state, &after.url).await?;
    }

    if status_changed {
        tracing::info!(
            url = %after.url,
            from = before.status.as_str(),
            to = after.status.as_str(),
            "merge proposal transitioned"
        );
        state
            .bus
            .publish(
                Topic::MergeProposalUpdated,
                serde_json::json!({
                    "event": "merge-proposal-updated",
                    "url": after.url,
                    "status": after.status.as_str(),
                    "codebase": after.codebase,
                    "merged_by": after.merged_by,
                }),
            )
            .await;
    }
    Ok(status_changed)
}

/// Mark the result branch a merged proposal delivered as absorbed.
async fn absorb_for_mp(state: &SharedPublisher, url: &str) -> Result<(), PublishError> {
    let url_owned = url.to_string();
    let absorbed = state
        .db
        .call(move |db| {
            let Some(publish) = db.latest_publish_for_mp(&url_owned)? else {
                return Ok(false);
            };
            let (Some(role), Some(revision)) = (publish.role.as_ref(), publish.revision.as_ref())
            else {
                return Ok(false);
            };
            let Some(run_id) =
                db.find_run_for_branch(&publish.codebase, &publish.campaign, role, revision)?
            else {
                return Ok(false);
            };
            db.absorb_result_branch(&run_id, role)?;
            if let Some(cs) = &publish.change_set {
                views::recompute_change_set_state(db.connection(), cs)?;
            }
            Ok(true)
        })
        .await?;
    if !absorbed {
        tracing::warn!(url = %url, "no run found for merged proposal");
    }
    Ok(())
}

/// Spawn the periodic proposal scan.
pub fn spawn_scan_loop(state: SharedPublisher) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(state.config.scan_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match scan(&state).await {
                Ok(report) if report.updated > 0 => {
                    tracing::info!(
                        scanned = report.scanned,
                        updated = report.updated,
                        "proposal scan"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "proposal scan failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::PublisherState;
    use super::super::vcs::ProposalStatus;
    use super::super::vcs::test_support::FakeVcs;
    use super::*;
    use crate::bus::EventBus;
    use crate::config::PublisherConfig;
    use crate::state::db::NewPublish;
    use crate::state::db::test_support::*;
    use crate::state::models::*;
    use crate::state::{Db, StateDb};
    use std::sync::Arc;

    fn fixture() -> (SharedPublisher, Db, Arc<FakeVcs>) {
        let db = Db::new(StateDb::new_in_memory().unwrap());
        let vcs = Arc::new(FakeVcs::default());
        let state = Arc::new(PublisherState::new(
            db.clone(),
            EventBus::new(db.clone()),
            vcs.clone(),
            PublisherConfig::default(),
        ));
        (state, db, vcs)
    }

    const MP_URL: &str = "https://forge.example/mp/1";

    /// A proposed-but-open publish chain: run r1 with an unabsorbed main
    /// branch, published as MP_URL.
    fn seed_open_proposal(db: &Db, change_set: Option<&str>) {
        let mut guard = db.lock_sync().unwrap();
        seed_codebase(&guard, "foo").unwrap();
        if let Some(cs) = change_set {
            guard.ensure_change_set(cs).unwrap();
        }
        let mut run = successful_run("r1", "foo", "lintian-fixes");
        run.change_set = change_set.map(String::from);
        guard
            .record_run(
                &run,
                &[ResultBranch {
                    run_id: "r1".into(),
                    role: "main".into(),
                    remote_name: None,
                    base_revision: Some("rev-a".into()),
                    revision: Some("rev-b".into()),
                    absorbed: false,
                }],
            )
            .unwrap();
        guard
            .insert_publish(&NewPublish {
                timestamp: Utc::now(),
                change_set: change_set.map(String::from),
                codebase: "foo".into(),
                campaign: "lintian-fixes".into(),
                role: Some("main".into()),
                mode: PublishMode::Propose,
                source_branch_url: None,
                target_branch_url: None,
                revision: Some("rev-b".into()),
                merge_proposal_url: Some(MP_URL.into()),
                result_code: "success".into(),
                description: None,
                requester: None,
            })
            .unwrap();
        guard
            .upsert_merge_proposal(&MergeProposal {
                url: MP_URL.into(),
                codebase: Some("foo".into()),
                target_branch_url: None,
                status: MergeProposalStatus::Open,
                revision: Some("rev-b".into()),
                merged_by: None,
                merged_at: None,
                last_scanned: None,
                can_be_merged: None,
                rate_limit_bucket: Some("maintainer-x".into()),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_scan_applies_merge_and_absorbs() -> anyhow::Result<()> {
        let (state, db, vcs) = fixture();
        seed_open_proposal(&db, Some("cs-1"));
        vcs.set_proposal(
            MP_URL,
            ProposalStatus {
                status: MergeProposalStatus::Merged,
                revision: Some("rev-b".into()),
                merged_by: Some("alice".into()),
                merged_at: Some(Utc::now()),
                can_be_merged: None,
            },
        );
        let mut rx = state.bus.subscribe();

        let report = scan(&state).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.updated, 1);

        let guard = db.lock_sync()?;
        let mp = guard.get_merge_proposal(MP_URL)?.unwrap();
        assert_eq!(mp.status, MergeProposalStatus::Merged);
        assert_eq!(mp.merged_by.as_deref(), Some("alice"));
        assert!(mp.last_scanned.is_some());
        assert!(guard.get_result_branches("r1")?[0].absorbed);
        // The change set completed: publish + all branches absorbed.
        assert_eq!(
            guard.get_change_set("cs-1")?.map(|cs| cs.state),
            Some(ChangeSetState::Done)
        );
        drop(guard);

        let event = rx.recv().await?;
        assert_eq!(event.topic, Topic::MergeProposalUpdated);
        assert_eq!(event.payload["status"], "merged");
        assert_eq!(event.payload["merged_by"], "alice");
        Ok(())
    }

    #[tokio::test]
    async fn test_repeat_scan_is_idempotent() -> anyhow::Result<()> {
        let (state, db, vcs) = fixture();
        seed_open_proposal(&db, None);
        vcs.set_proposal(
            MP_URL,
            ProposalStatus {
                status: MergeProposalStatus::Merged,
                revision: Some("rev-b".into()),
                merged_by: Some("alice".into()),
                merged_at: Some(Utc::now()),
                can_be_merged: None,
            },
        );

        assert!(refresh_proposal(&state, MP_URL).await.unwrap());
        // Same forge state again: no status change, same row contents.
        assert!(!refresh_proposal(&state, MP_URL).await.unwrap());
        let guard = db.lock_sync()?;
        let mp = guard.get_merge_proposal(MP_URL)?.unwrap();
        assert_eq!(mp.status, MergeProposalStatus::Merged);
        assert_eq!(mp.merged_by.as_deref(), Some("alice"));
        Ok(())
    }

    #[tokio::test]
    async fn test_abandon_closes_without_absorbing() -> anyhow::Result<()> {
        let (state, db, vcs) = fixture();
        seed_open_proposal(&db, None);
        vcs.set_proposal(
            MP_URL,
            ProposalStatus {
                status: MergeProposalStatus::Open,
                revision: None,
                merged_by: None,
                merged_at: None,
                can_be_merged: None,
            },
        );

        abandon_mp(&state, MP_URL, "superseded by a newer run").await.unwrap();

        let guard = db.lock_sync()?;
        let mp = guard.get_merge_proposal(MP_URL)?.unwrap();
        assert_eq!(mp.status, MergeProposalStatus::Abandoned);
        assert!(!guard.get_result_branches("r1")?[0].absorbed);
        // The forge-side proposal was closed too.
        drop(guard);
        let forge_state = vcs.proposal_states.lock().unwrap();
        assert_eq!(
            forge_state.get(MP_URL).unwrap().status,
            MergeProposalStatus::Closed
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_straggler_check_targets_stale_scans() -> anyhow::Result<()> {
        let (state, db, vcs) = fixture();
        seed_open_proposal(&db, None);
        vcs.set_proposal(
            MP_URL,
            ProposalStatus {
                status: MergeProposalStatus::Open,
                revision: None,
                merged_by: None,
                merged_at: None,
                can_be_merged: Some(true),
            },
        );

        // Never scanned: counts as a straggler.
        assert_eq!(check_stragglers(&state).await.unwrap(), 1);
        // Freshly scanned: not a straggler any more.
        assert_eq!(check_stragglers(&state).await.unwrap(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_unknown_proposal_errors() {
        let (state, _db, _vcs) = fixture();
        let err = refresh_proposal(&state, "https://forge.example/mp/404")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no-run-for-mp");
    }
}
