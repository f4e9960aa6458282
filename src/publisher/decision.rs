//! The publish decision function.
//!
//! `consider_run` evaluates a run against the ten-step check chain of the
//! publish policy. Checks run in a fixed order and the decision is the
//! first failing check; the full chain is still reported so operators can
//! see every blocker at once.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;

use super::SharedPublisher;
use crate::config::PublisherConfig;
use crate::errors::PublishError;
use crate::runner::hosts::host_of;
use crate::state::StateDb;
use crate::state::models::{
    Candidate, ChangeSetState, PolicyRule, PublishMode, PublishStatus, ResultBranch, Run,
    result_code,
};

/// Outcome of a single check: `result` is true when the check passes.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub result: bool,
    pub details: serde_json::Value,
}

/// Everything needed to execute an accepted publish.
#[derive(Debug, Clone, Serialize)]
pub struct PublishPlan {
    pub run_id: String,
    pub codebase: String,
    pub campaign: String,
    pub role: String,
    pub mode: PublishMode,
    pub revision: String,
    pub target_branch_url: Option<String>,
    pub rate_limit_bucket: Option<String>,
    pub change_set: Option<String>,
    pub commit_message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    Accepted { plan: PublishPlan },
    Blocked { key: String },
}

/// Per-role evaluation: the ordered check chain plus the decision.
#[derive(Debug, Clone, Serialize)]
pub struct RoleConsideration {
    pub role: String,
    pub checks: Vec<(&'static str, Check)>,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct Consideration {
    pub run_id: String,
    pub roles: Vec<RoleConsideration>,
}

impl Consideration {
    pub fn accepted_plans(&self) -> Vec<PublishPlan> {
        self.roles
            .iter()
            .filter_map(|role| match &role.decision {
                Decision::Accepted { plan } => Some(plan.clone()),
                Decision::Blocked { .. } => None,
            })
            .collect()
    }

    pub fn is_accepted(&self) -> bool {
        !self.accepted_plans().is_empty()
    }

    /// Blocker map per role: check key -> {result, details}, §7 shape.
    pub fn blockers(&self) -> serde_json::Value {
        let mut by_role = serde_json::Map::new();
        for role in &self.roles {
            let mut checks = serde_json::Map::new();
            for (key, check) in &role.checks {
                checks.insert(
                    (*key).to_string(),
                    serde_json::json!({"result": check.result, "details": check.details}),
                );
            }
            by_role.insert(role.role.clone(), serde_json::Value::Object(checks));
        }
        serde_json::Value::Object(by_role)
    }
}

/// Minimum wait before the next publish attempt: `min(2^n x 1h, 7d)`,
/// with attempt 0 allowed immediately.
pub fn backoff_wait(attempt_count: u32) -> Duration {
    if attempt_count == 0 {
        return Duration::zero();
    }
    let hours = 1i64 << attempt_count.min(20);
    Duration::hours(hours.min(168))
}

/// When the next attempt becomes allowed. With no prior attempts this is
/// the run's own finish time (immediate retry allowed).
pub fn next_try_time(
    run_finish: DateTime<Utc>,
    last_attempt: Option<DateTime<Utc>>,
    attempt_count: u32,
) -> DateTime<Utc> {
    match (attempt_count, last_attempt) {
        (0, _) => run_finish,
        (n, Some(last)) => last + backoff_wait(n),
        (n, None) => run_finish + backoff_wait(n),
    }
}

/// Ambient facts the check chain needs beyond the store.
pub struct EvalContext<'a> {
    pub cfg: &'a PublisherConfig,
    pub now: DateTime<Utc>,
    pub forge_retry_after: Option<DateTime<Utc>>,
    pub target_branch_url: Option<String>,
}

/// Evaluate the full check chain for one role of a run.
pub fn evaluate_role(
    db: &StateDb,
    ctx: &EvalContext<'_>,
    run: &Run,
    candidate: &Candidate,
    rule: &PolicyRule,
    branch: &ResultBranch,
    mode_override: Option<PublishMode>,
) -> Result<RoleConsideration> {
    let mode = mode_override.unwrap_or(rule.mode);
    let mut checks: Vec<(&'static str, Check)> = Vec::new();

    checks.push((
        "missing-revision",
        Check {
            result: run.revision.is_some(),
            details: serde_json::json!({}),
        },
    ));

    checks.push((
        "command",
        Check {
            result: candidate.command == run.command,
            details: serde_json::json!({
                "actual": run.command,
                "correct": candidate.command,
            }),
        },
    ));

    checks.push((
        "success",
        Check {
            result: run.result_code == result_code::SUCCESS,
            details: serde_json::json!({"result_code": run.result_code}),
        },
    ));

    let status_ok = match run.publish_status {
        PublishStatus::Approved | PublishStatus::Ignored => true,
        PublishStatus::Unknown => !ctx.cfg.review_required,
        PublishStatus::Blocked | PublishStatus::NeedsManualReview | PublishStatus::Rejected => {
            false
        }
    };
    checks.push((
        "publish_status",
        Check {
            result: status_ok,
            details: serde_json::json!({"status": run.publish_status.as_str()}),
        },
    ));

    let push_check = if matches!(
        mode,
        PublishMode::Push | PublishMode::PushDerived | PublishMode::AttemptPush
    ) {
        let recent =
            db.count_recent_pushes(Duration::seconds(ctx.cfg.push_period_secs as i64))?;
        Check {
            result: recent < ctx.cfg.push_limit,
            details: serde_json::json!({"recent": recent, "max": ctx.cfg.push_limit}),
        }
    } else {
        Check {
            result: true,
            details: serde_json::json!({}),
        }
    };
    checks.push(("push-limit", push_check));

    let (attempt_count, last_attempt) =
        db.failed_attempts_since_success(&run.codebase, &run.campaign, &rule.role)?;
    let next_try = next_try_time(run.finish_time, last_attempt, attempt_count);
    checks.push((
        "backoff",
        Check {
            result: ctx.now >= next_try,
            details: serde_json::json!({
                "attempt_count": attempt_count,
                "next_try_time": next_try.to_rfc3339(),
            }),
        },
    ));

    let propose_check = match (mode, rule.rate_limit_bucket.as_deref()) {
        (PublishMode::Propose, Some(bucket)) => {
            let open = db.open_mp_count_for_bucket(bucket)?;
            let max_open = rule.max_open_mps.unwrap_or(ctx.cfg.default_max_open_mps);
            Check {
                result: open < max_open,
                details: serde_json::json!({
                    "bucket": bucket,
                    "open": open,
                    "max_open": max_open,
                }),
            }
        }
        _ => Check {
            result: true,
            details: serde_json::json!({}),
        },
    };
    checks.push(("propose_rate_limit", propose_check));

    checks.push((
        "forge-rate-limited",
        Check {
            result: ctx.forge_retry_after.is_none(),
            details: serde_json::json!({
                "retry_after": ctx.forge_retry_after.map(|t| t.to_rfc3339()),
            }),
        },
    ));

    let (cs_ok, cs_details) = change_set_check(db, run)?;
    checks.push((
        "change-set-state",
        Check {
            result: cs_ok,
            details: cs_details,
        },
    ));

    checks.push((
        "previous_mp",
        Check {
            result: !db.has_rejected_mp(&run.codebase, &run.campaign, &rule.role)?,
            details: serde_json::json!({}),
        },
    ));

    let decision = match checks.iter().find(|(_, check)| !check.result) {
        Some((key, _)) => Decision::Blocked {
            key: (*key).to_string(),
        },
        None => {
            let revision = branch
                .revision
                .clone()
                .or_else(|| run.revision.clone())
                .unwrap_or_default();
            Decision::Accepted {
                plan: PublishPlan {
                    run_id: run.id.clone(),
                    codebase: run.codebase.clone(),
                    campaign: run.campaign.clone(),
                    role: rule.role.clone(),
                    mode,
                    revision,
                    target_branch_url: ctx.target_branch_url.clone(),
                    rate_limit_bucket: rule.rate_limit_bucket.clone(),
                    change_set: run.change_set.clone(),
                    commit_message: run
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("{}: automated change", run.campaign)),
                },
            }
        }
    };

    Ok(RoleConsideration {
        role: rule.role.clone(),
        checks,
        decision,
    })
}

/// The enclosing change set must be working or ready. Publishing passes
/// only when this target already delivered a publish in the same change
/// set; created and done always block.
fn change_set_check(db: &StateDb, run: &Run) -> Result<(bool, serde_json::Value)> {
    let Some(cs_id) = &run.change_set else {
        return Ok((true, serde_json::json!({"state": null})));
    };
    let Some(change_set) = db.get_change_set(cs_id)? else {
        return Ok((true, serde_json::json!({"state": null})));
    };
    let pass = match change_set.state {
        ChangeSetState::Working | ChangeSetState::Ready => true,
        ChangeSetState::Publishing => {
            let own_publishes: i64 = db.connection().query_row(
                "SELECT COUNT(*) FROM publish
                 WHERE change_set = ?1 AND codebase = ?2 AND campaign = ?3
                   AND result_code = 'success'",
                params![cs_id, run.codebase, run.campaign],
                |row| row.get(0),
            )?;
            own_publishes > 0
        }
        ChangeSetState::Created | ChangeSetState::Done => false,
    };
    Ok((pass, serde_json::json!({"state": change_set.state.as_str()})))
}

/// Load a run and evaluate every publishable role.
pub async fn consider_run(
    state: &SharedPublisher,
    run_id: &str,
    mode_override: Option<PublishMode>,
) -> Result<Consideration, PublishError> {
    let id = run_id.to_string();
    let run = state
        .db
        .call(move |db| db.get_run(&id))
        .await?
        .ok_or_else(|| PublishError::UnknownRun(run_id.to_string()))?;

    // Forge pressure is keyed by the target host, known before the store
    // round-trip.
    let codebase_name = run.codebase.clone();
    let codebase = state
        .db
        .call(move |db| db.get_codebase(&codebase_name))
        .await?;
    let target_branch_url = codebase.map(|cb| cb.branch_url);
    let forge_retry_after = target_branch_url
        .as_deref()
        .and_then(host_of)
        .and_then(|host| state.forge_retry_after(&host));

    let cfg = state.config.clone();
    let run_for_eval = run.clone();
    let consideration = state
        .db
        .call(move |db| {
            let candidate = candidate_for(db, &run_for_eval)?
                .ok_or_else(|| anyhow::anyhow!("no candidate for run"))?;
            let rules = db.get_policy(&candidate.policy)?;
            if rules.is_empty() {
                anyhow::bail!("unknown policy {}", candidate.policy);
            }
            let branches = db.get_result_branches(&run_for_eval.id)?;
            let unabsorbed: HashSet<&str> = branches
                .iter()
                .filter(|b| !b.absorbed)
                .map(|b| b.role.as_str())
                .collect();
            let ctx = EvalContext {
                cfg: &cfg,
                now: Utc::now(),
                forge_retry_after,
                target_branch_url,
            };
            let mut roles = Vec::new();
            for rule in &rules {
                let effective = mode_override.unwrap_or(rule.mode);
                if effective.is_inert() || !unabsorbed.contains(rule.role.as_str()) {
                    continue;
                }
                let Some(branch) = branches.iter().find(|b| b.role == rule.role) else {
                    continue;
                };
                roles.push(evaluate_role(
                    db,
                    &ctx,
                    &run_for_eval,
                    &candidate,
                    rule,
                    branch,
                    mode_override,
                )?);
            }
            Ok(Consideration {
                run_id: run_for_eval.id.clone(),
                roles,
            })
        })
        .await
        .map_err(|err| {
            let message = err.to_string();
            if message.starts_with("unknown policy") {
                PublishError::UnknownPolicy(message.trim_start_matches("unknown policy ").into())
            } else {
                PublishError::Other(err)
            }
        })?;
    Ok(consideration)
}

pub(crate) fn candidate_for(db: &StateDb, run: &Run) -> Result<Option<Candidate>> {
    if run.change_set.is_some() {
        if let Some(found) =
            db.get_candidate(&run.codebase, &run.campaign, run.change_set.as_deref())?
        {
            return Ok(Some(found));
        }
    }
    db.get_candidate(&run.codebase, &run.campaign, None)
}
