//! Queue scheduling operations.

use serde::{Deserialize, Serialize};

use crate::errors::RunnerError;
use crate::state::models::{Candidate, QueueBucket, QueueItem};
use crate::state::{StateDb, views};

/// Command used for baseline (unchanged) builds.
pub const CONTROL_COMMAND: &str = "control";

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub codebase: String,
    pub campaign: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub change_set: Option<String>,
    /// Added to the computed priority; negative schedules earlier.
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub bucket: Option<QueueBucket>,
    #[serde(default)]
    pub requester: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResponse {
    pub queue_id: i64,
    pub bucket: QueueBucket,
    pub position: i64,
    pub queue_depth: i64,
    pub estimated_duration_secs: i64,
}

/// Insert a queue item for an operator or scheduler request.
///
/// Priority derives from the candidate value (falling back to the codebase
/// weight): more valuable work sorts earlier. The slot constraint makes a
/// second schedule for the same target a conflict rather than a duplicate.
pub fn schedule(db: &mut StateDb, req: &ScheduleRequest) -> Result<ScheduleResponse, RunnerError> {
    let codebase = db
        .get_codebase(&req.codebase)?
        .ok_or_else(|| RunnerError::UnknownCodebase(req.codebase.clone()))?;
    let candidate = db.get_candidate(&req.codebase, &req.campaign, req.change_set.as_deref())?;

    let command = req
        .command
        .clone()
        .or_else(|| candidate.as_ref().map(|c| c.command.clone()))
        .unwrap_or_else(|| req.campaign.clone());
    let bucket = req.bucket.unwrap_or(QueueBucket::Default);
    let priority = base_priority(&candidate, codebase.value) + req.offset.unwrap_or(0);
    let estimated = db
        .estimate_duration(&req.codebase, &req.campaign)?
        .unwrap_or(900);

    if let Some(cs) = req.change_set.as_deref() {
        db.ensure_change_set(cs)?;
    }
    let item = db
        .insert_queue_item(
            &req.codebase,
            &req.campaign,
            &command,
            priority,
            bucket,
            Some(estimated),
            req.change_set.as_deref(),
            req.requester.as_deref(),
            req.refresh,
        )?
        .ok_or_else(|| RunnerError::DuplicateSchedule {
            codebase: req.codebase.clone(),
            campaign: req.campaign.clone(),
        })?;

    respond(db, &item, estimated)
}

/// Schedule a baseline build of the unchanged branch, used by the differ
/// as comparison input. Control runs sit in their own bucket.
pub fn schedule_control(
    db: &mut StateDb,
    req: &ScheduleRequest,
) -> Result<ScheduleResponse, RunnerError> {
    let control = ScheduleRequest {
        campaign: CONTROL_COMMAND.to_string(),
        command: Some(CONTROL_COMMAND.to_string()),
        bucket: Some(QueueBucket::Control),
        ..req.clone()
    };
    schedule(db, &control)
}

/// Re-enqueue a transiently failed run. An occupied slot means newer work
/// is already queued, which supersedes the retry.
pub fn reschedule_transient(
    db: &mut StateDb,
    codebase: &str,
    campaign: &str,
    command: &str,
    change_set: Option<&str>,
) -> Result<Option<QueueItem>, RunnerError> {
    let estimated = db.estimate_duration(codebase, campaign)?.unwrap_or(900);
    let item = db.insert_queue_item(
        codebase,
        campaign,
        command,
        0,
        QueueBucket::Reschedule,
        Some(estimated),
        change_set,
        Some("watchdog"),
        true,
    )?;
    Ok(item)
}

fn base_priority(candidate: &Option<Candidate>, codebase_value: i64) -> i64 {
    let value = candidate
        .as_ref()
        .and_then(|c| c.value)
        .unwrap_or(codebase_value);
    // Success-chance discounts the value: unlikely candidates sort later.
    let chance = candidate
        .as_ref()
        .and_then(|c| c.success_chance)
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);
    -((value as f64 * chance) as i64)
}

fn respond(
    db: &StateDb,
    item: &QueueItem,
    estimated: i64,
) -> Result<ScheduleResponse, RunnerError> {
    let (position, queue_depth) = views::queue_position(db.connection(), item.id)?
        .ok_or_else(|| anyhow::anyhow!("Queue item vanished after insert"))?;
    Ok(ScheduleResponse {
        queue_id: item.id,
        bucket: item.bucket,
        position,
        queue_depth,
        estimated_duration_secs: estimated,
    })
}
