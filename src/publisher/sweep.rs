//! Publish execution and the periodic queue-processing loop.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Serialize;

use super::decision::{self, PublishPlan};
use super::vcs::PublishRequest;
use super::SharedPublisher;
use crate::bus::Topic;
use crate::errors::PublishError;
use crate::metrics::METRICS;
use crate::runner::hosts::host_of;
use crate::state::db::NewPublish;
use crate::state::models::{MergeProposal, MergeProposalStatus, PublishMode};
use crate::state::views;

/// Hard ceiling on one VCS publish operation.
const PUBLISH_TIMEOUT: StdDuration = StdDuration::from_secs(120);

/// Fallback forge cooldown when no Retry-After was provided.
const DEFAULT_RETRY_AFTER_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutedPublish {
    pub publish_id: i64,
    pub run_id: String,
    pub role: String,
    pub mode: PublishMode,
    pub result_code: String,
    pub proposal_url: Option<String>,
    pub description: Option<String>,
}

/// Execute one accepted publish plan under the per-target lock.
///
/// Every attempt lands as a publish row, successful or not; failures feed
/// the backoff counter and, for forge pressure, the host cooldown table.
/// Absorption and merge-proposal rows follow the outcome.
pub async fn execute_plan(
    state: &SharedPublisher,
    plan: &PublishPlan,
    requester: Option<&str>,
) -> Result<ExecutedPublish, PublishError> {
    let lock = state.target_lock(&plan.codebase, &plan.campaign).await;
    let _guard = lock.lock().await;

    let request = PublishRequest {
        mode: plan.mode,
        codebase: plan.codebase.clone(),
        campaign: plan.campaign.clone(),
        role: plan.role.clone(),
        target_branch_url: plan.target_branch_url.clone().unwrap_or_default(),
        source_branch_url: None,
        revision: plan.revision.clone(),
        commit_message: plan.commit_message.clone(),
        title: (plan.mode == PublishMode::Propose).then(|| plan.commit_message.clone()),
        labels: Vec::new(),
        debdiff: None,
    };

    let outcome = match tokio::time::timeout(PUBLISH_TIMEOUT, state.vcs.publish_one(&request))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(PublishError::NetworkError(format!(
            "publish of {}/{} timed out",
            plan.codebase, plan.campaign
        ))),
    };

    match outcome {
        Ok(published) => {
            let executed = record_success(state, plan, requester, &published).await?;
            METRICS.inc_publishes();
            tracing::info!(
                run_id = %plan.run_id,
                codebase = %plan.codebase,
                campaign = %plan.campaign,
                role = %plan.role,
                mode = plan.mode.as_str(),
                proposal_url = executed.proposal_url.as_deref().unwrap_or(""),
                "published"
            );
            Ok(executed)
        }
        Err(err) => {
            record_failure(state, plan, requester, &err).await?;
            METRICS.inc_publish_failures();
            tracing::warn!(
                run_id = %plan.run_id,
                codebase = %plan.codebase,
                campaign = %plan.campaign,
                code = err.code(),
                "publish failed"
            );
            Err(err)
        }
    }
}

async fn record_success(
    state: &SharedPublisher,
    plan: &PublishPlan,
    requester: Option<&str>,
    published: &super::vcs::PublishOutcome,
) -> Result<ExecutedPublish, PublishError> {
    let now = Utc::now();
    let new_publish = NewPublish {
        timestamp: now,
        change_set: plan.change_set.clone(),
        codebase: plan.codebase.clone(),
        campaign: plan.campaign.clone(),
        role: Some(plan.role.clone()),
        mode: plan.mode,
        source_branch_url: None,
        target_branch_url: plan.target_branch_url.clone(),
        revision: Some(plan.revision.clone()),
        merge_proposal_url: published.proposal_url.clone(),
        result_code: "success".to_string(),
        description: Some(published.description.clone()),
        requester: requester.map(String::from),
    };

    let plan_c = plan.clone();
    let published_c = published.clone();
    let publish_id = state
        .db
        .call(move |db| {
            let id = db.insert_publish(&new_publish)?;
            match plan_c.mode {
                PublishMode::Push | PublishMode::AttemptPush | PublishMode::PushDerived => {
                    db.absorb_result_branch(&plan_c.run_id, &plan_c.role)?;
                }
                PublishMode::Propose => {
                    if let Some(url) = &published_c.proposal_url {
                        let existing = db.get_merge_proposal(url)?;
                        let mp = MergeProposal {
                            url: url.clone(),
                            codebase: Some(plan_c.codebase.clone()),
                            target_branch_url: plan_c.target_branch_url.clone(),
                            status: existing
                                .as_ref()
                                .map(|m| m.status)
                                .unwrap_or(MergeProposalStatus::Open),
                            revision: Some(plan_c.revision.clone()),
                            merged_by: existing.as_ref().and_then(|m| m.merged_by.clone()),
                            merged_at: existing.as_ref().and_then(|m| m.merged_at),
                            last_scanned: Some(Utc::now()),
                            can_be_merged: existing.as_ref().and_then(|m| m.can_be_merged),
                            rate_limit_bucket: plan_c.rate_limit_bucket.clone(),
                        };
                        db.upsert_merge_proposal(&mp)?;
                    }
                }
                PublishMode::BuildOnly | PublishMode::Skip | PublishMode::Bts => {}
            }
            if let Some(cs) = &plan_c.change_set {
                views::recompute_change_set_state(db.connection(), cs)?;
            }
            Ok(id)
        })
        .await?;

    emit_publish_result(state, plan, "success", published.proposal_url.as_deref()).await;
    if plan.mode == PublishMode::Propose && published.is_new {
        if let Some(url) = &published.proposal_url {
            state
                .bus
                .publish(
                    Topic::MergeProposalUpdated,
                    serde_json::json!({
                        "event": "merge-proposal-updated",
                        "url": url,
                        "status": "open",
                        "codebase": plan.codebase,
                    }),
                )
                .await;
        }
    }

    Ok(ExecutedPublish {
        publish_id,
        run_id: plan.run_id.clone(),
        role: plan.role.clone(),
        mode: plan.mode,
        result_code: "success".into(),
        proposal_url: published.proposal_url.clone(),
        description: Some(published.description.clone()),
    })
}

async fn record_failure(
    state: &SharedPublisher,
    plan: &PublishPlan,
    requester: Option<&str>,
    err: &PublishError,
) -> Result<(), PublishError> {
    let new_publish = NewPublish {
        timestamp: Utc::now(),
        change_set: plan.change_set.clone(),
        codebase: plan.codebase.clone(),
        campaign: plan.campaign.clone(),
        role: Some(plan.role.clone()),
        mode: plan.mode,
        source_branch_url: None,
        target_branch_url: plan.target_branch_url.clone(),
        revision: Some(plan.revision.clone()),
        merge_proposal_url: None,
        result_code: err.code().to_string(),
        description: Some(err.to_string()),
        requester: requester.map(String::from),
    };
    state
        .db
        .call(move |db| db.insert_publish(&new_publish).map(|_| ()))
        .await?;

    // Forge pressure throttles the whole host, not just this target.
    if let PublishError::BranchRateLimited { retry_after_secs } = err {
        if let Some(host) = plan.target_branch_url.as_deref().and_then(host_of) {
            let until = Utc::now()
                + Duration::seconds(retry_after_secs.map_or(DEFAULT_RETRY_AFTER_SECS, |s| s as i64));
            state.note_forge_limit(&host, until);
        }
    } else if let PublishError::BranchBusy(_) = err {
        if let Some(host) = plan.target_branch_url.as_deref().and_then(host_of) {
            state.note_forge_limit(&host, Utc::now() + Duration::seconds(DEFAULT_RETRY_AFTER_SECS));
        }
    }

    emit_publish_result(state, plan, err.code(), None).await;
    Ok(())
}

async fn emit_publish_result(
    state: &SharedPublisher,
    plan: &PublishPlan,
    result_code: &str,
    proposal_url: Option<&str>,
) {
    state
        .bus
        .publish(
            Topic::PublishResult,
            serde_json::json!({
                "event": "publish-result",
                "run_id": plan.run_id,
                "codebase": plan.codebase,
                "campaign": plan.campaign,
                "role": plan.role,
                "mode": plan.mode.as_str(),
                "result_code": result_code,
                "proposal_url": proposal_url,
            }),
        )
        .await;
}

/// One pass over `publish_ready`: round-robin across rate-limit buckets,
/// capped per tick. Returns the number of successful publishes.
pub async fn process_queue_tick(state: &SharedPublisher) -> Result<usize, PublishError> {
    let entries = state
        .db
        .call(|db| views::publish_ready(db.connection()))
        .await?;

    // Fair rotation: one entry per bucket per round.
    let mut buckets: BTreeMap<String, VecDeque<String>> = BTreeMap::new();
    for entry in entries {
        let bucket = entry
            .rules
            .first()
            .and_then(|r| r.rate_limit_bucket.clone())
            .unwrap_or_default();
        buckets.entry(bucket).or_default().push_back(entry.run.id);
    }

    let mut published = 0usize;
    let mut considered = 0usize;
    'tick: while !buckets.is_empty() {
        let keys: Vec<String> = buckets.keys().cloned().collect();
        for key in keys {
            let Some(queue) = buckets.get_mut(&key) else {
                continue;
            };
            let Some(run_id) = queue.pop_front() else {
                buckets.remove(&key);
                continue;
            };
            if queue.is_empty() {
                buckets.remove(&key);
            }
            considered += 1;
            match decision::consider_run(state, &run_id, None).await {
                Ok(consideration) => {
                    for plan in consideration.accepted_plans() {
                        if execute_plan(state, &plan, None).await.is_ok() {
                            published += 1;
                        }
                        if published >= state.config.max_publishes_per_tick {
                            break 'tick;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "consider failed");
                }
            }
            if considered >= state.config.max_publishes_per_tick * 4 {
                break 'tick;
            }
        }
    }
    Ok(published)
}

/// Spawn the periodic queue-processing loop.
pub fn spawn_queue_loop(state: SharedPublisher) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(
            state.config.queue_loop_interval_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match process_queue_tick(&state).await {
                Ok(count) if count > 0 => {
                    tracing::info!(published = count, "publish queue tick");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "publish queue tick failed"),
            }
        }
    })
}
