//! Result ingestion: staged uploads, `finish`, and watchdog aborts.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;

use super::SharedRunner;
use super::protocol::WorkerResult;
use super::queue;
use crate::artifacts::is_log_filename;
use crate::bus::Topic;
use crate::errors::RunnerError;
use crate::metrics::METRICS;
use crate::state::models::{PublishStatus, ResultBranch, Run, result_code};

fn staging_path(state: &SharedRunner, log_id: &str) -> PathBuf {
    state.staging_dir.join(log_id)
}

fn safe_upload_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < 255
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
}

/// Stage an uploaded file for a leased run. Overwriting the same name is
/// the retry path, so uploads are idempotent by `(run_id, name)`.
pub async fn stage_upload(
    state: &SharedRunner,
    log_id: &str,
    name: &str,
    bytes: &[u8],
) -> Result<(), RunnerError> {
    if !safe_upload_name(name) {
        return Err(RunnerError::InvalidLogName(name.to_string()));
    }
    let id = log_id.to_string();
    let active = state
        .db
        .call(move |db| db.get_active_run(&id))
        .await?
        .is_some();
    if !active {
        return Err(RunnerError::UnknownRun(log_id.to_string()));
    }
    let dir = staging_path(state, log_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .context("Failed to create staging directory")?;
    tokio::fs::write(dir.join(name), bytes)
        .await
        .with_context(|| format!("Failed to stage upload {name}"))?;
    Ok(())
}

/// Ingest a worker result.
///
/// Uploads stream to the log/artifact stores first; the run row, its
/// branches, and the lease delete then commit in one transaction, and the
/// `run-finished` event fires only after that commit. A failure between
/// upload and commit leaves the lease in place, so the worker's retry of
/// `finish` with the same log_id converges on the same state.
pub async fn finish(
    state: &SharedRunner,
    log_id: &str,
    result: WorkerResult,
) -> Result<Run, RunnerError> {
    let id = log_id.to_string();
    let active = state.db.call(move |db| db.get_active_run(&id)).await?;
    let Some(active) = active else {
        let id = log_id.to_string();
        let already = state.db.call(move |db| db.get_run(&id)).await?.is_some();
        return Err(if already {
            RunnerError::AlreadyFinished(log_id.to_string())
        } else {
            RunnerError::UnknownRun(log_id.to_string())
        });
    };

    if result.code.is_empty() {
        return Err(RunnerError::InvalidResult("missing result code".into()));
    }
    if result.code == result_code::NOTHING_NEW_TO_DO && active.resume_from.is_none() {
        return Err(RunnerError::InvalidResult(
            "nothing-new-to-do without a resume baseline".into(),
        ));
    }

    let failure_transient = classify_transience(&result);
    let branches: Vec<ResultBranch> = result
        .branches
        .iter()
        .map(|(role, remote_name, base_revision, revision)| ResultBranch {
            run_id: log_id.to_string(),
            role: role.clone(),
            remote_name: remote_name.clone(),
            base_revision: base_revision.clone(),
            revision: revision.clone(),
            absorbed: false,
        })
        .collect();

    let logfilenames = upload_staged_files(state, log_id)
        .await
        .map_err(|err| RunnerError::UploadFailed(err.to_string()))?;

    let run = Run {
        id: log_id.to_string(),
        codebase: active.codebase.clone(),
        campaign: active.campaign.clone(),
        command: active.command.clone(),
        start_time: result.start_time.unwrap_or(active.start_time),
        finish_time: result.finish_time.unwrap_or_else(Utc::now),
        result_code: result.code.clone(),
        failure_stage: result.stage.clone(),
        failure_transient,
        description: result.description.clone(),
        revision: result.revision.clone(),
        main_branch_revision: result.main_branch_revision.clone(),
        worker: Some(active.worker.clone()),
        logfilenames,
        result: Some(serde_json::to_value(&result).context("Failed to serialize result")?),
        value: result.value,
        publish_status: PublishStatus::Unknown,
        resume_from: active.resume_from.clone(),
        change_set: active.change_set.clone(),
    };

    let stored = {
        let run = run.clone();
        let branches = branches.clone();
        state
            .db
            .call(move |db| {
                match db.record_run(&run, &branches) {
                    Ok(()) => Ok(true),
                    // A concurrent finish for the same log_id won the race.
                    Err(err) => match db.get_run(&run.id)? {
                        Some(_) => Ok(false),
                        None => Err(err),
                    },
                }
            })
            .await?
    };
    if !stored {
        return Err(RunnerError::AlreadyFinished(log_id.to_string()));
    }

    let _ = tokio::fs::remove_dir_all(staging_path(state, log_id)).await;

    METRICS.inc_runs_finished();
    tracing::info!(
        run_id = %run.id,
        codebase = %run.codebase,
        campaign = %run.campaign,
        result_code = %run.result_code,
        "run finished"
    );
    state
        .bus
        .publish(Topic::RunFinished, run_finished_payload(&run))
        .await;
    maybe_reschedule(state, &run).await;
    Ok(run)
}

/// Abort a leased run on behalf of the watchdog or an operator kill.
///
/// Returns `None` when the lease no longer exists: the abort already
/// happened, and repeat sweeps are a no-op.
pub async fn abort_run(
    state: &SharedRunner,
    log_id: &str,
    code: &str,
    description: &str,
    transient: bool,
) -> Result<Option<Run>, RunnerError> {
    let id = log_id.to_string();
    let code = code.to_string();
    let description = description.to_string();
    let run = state
        .db
        .call(move |db| {
            let Some(active) = db.get_active_run(&id)? else {
                return Ok(None);
            };
            let run = Run {
                id: active.log_id.clone(),
                codebase: active.codebase.clone(),
                campaign: active.campaign.clone(),
                command: active.command.clone(),
                start_time: active.start_time,
                finish_time: Utc::now(),
                result_code: code.clone(),
                failure_stage: None,
                failure_transient: Some(transient),
                description: Some(description.clone()),
                revision: None,
                main_branch_revision: None,
                worker: Some(active.worker.clone()),
                logfilenames: Vec::new(),
                result: None,
                value: None,
                publish_status: PublishStatus::Unknown,
                resume_from: active.resume_from.clone(),
                change_set: active.change_set.clone(),
            };
            match db.record_run(&run, &[]) {
                Ok(()) => Ok(Some(run)),
                Err(err) => match db.get_run(&run.id)? {
                    Some(_) => Ok(None),
                    None => Err(err),
                },
            }
        })
        .await?;

    if let Some(run) = &run {
        tracing::warn!(
            run_id = %run.id,
            codebase = %run.codebase,
            result_code = %run.result_code,
            "aborted active run"
        );
        state
            .bus
            .publish(Topic::RunFinished, run_finished_payload(run))
            .await;
        maybe_reschedule(state, run).await;
    }
    Ok(run)
}

fn classify_transience(result: &WorkerResult) -> Option<bool> {
    if matches!(
        result.code.as_str(),
        result_code::SUCCESS | result_code::NOTHING_TO_DO | result_code::NOTHING_NEW_TO_DO
    ) {
        return None;
    }
    Some(
        result
            .transient
            .unwrap_or_else(|| result_code::default_transient(&result.code)),
    )
}

/// Push staged files to the log and artifact stores. Returns the stored
/// log file names for the run row.
async fn upload_staged_files(state: &SharedRunner, log_id: &str) -> Result<Vec<String>> {
    let dir = staging_path(state, log_id);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut logs = Vec::new();
    let mut artifact_names = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .context("Failed to read staging directory")?;
    while let Some(entry) = entries.next_entry().await.context("Failed to list staging")? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_log_filename(&name) {
            logs.push(name);
        } else {
            artifact_names.push(name);
        }
    }
    logs.sort();
    if !logs.is_empty() {
        state.artifacts.store_logs(log_id, &dir).await?;
    }
    if !artifact_names.is_empty() {
        state
            .artifacts
            .store(log_id, &dir, Some(&artifact_names))
            .await?;
    }
    Ok(logs)
}

async fn maybe_reschedule(state: &SharedRunner, run: &Run) {
    if run.failure_transient != Some(true) || !state.config.retry_transient {
        return;
    }
    let codebase = run.codebase.clone();
    let campaign = run.campaign.clone();
    let command = run.command.clone();
    let change_set = run.change_set.clone();
    let outcome = state
        .db
        .call(move |db| {
            queue::reschedule_transient(db, &codebase, &campaign, &command, change_set.as_deref())
                .map_err(|e| anyhow::anyhow!(e))
        })
        .await;
    match outcome {
        Ok(Some(item)) => {
            tracing::info!(
                codebase = %run.codebase,
                campaign = %run.campaign,
                queue_id = item.id,
                "re-enqueued after transient failure"
            );
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(error = %err, "failed to re-enqueue transient failure");
        }
    }
}

pub(crate) fn run_finished_payload(run: &Run) -> serde_json::Value {
    serde_json::json!({
        "event": "run-finished",
        "run_id": run.id,
        "codebase": run.codebase,
        "campaign": run.campaign,
        "result_code": run.result_code,
        "change_set": run.change_set,
    })
}
