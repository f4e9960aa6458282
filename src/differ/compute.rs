//! Single-flight diff computation with OS resource caps.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

use super::SharedDiffer;
use super::cache::cache_key;
use crate::errors::DifferError;
use crate::metrics::METRICS;

/// Bumped when a tool upgrade changes output format, invalidating the
/// cache for that tool.
const DEBDIFF_EPOCH: &str = "1";
const DIFFOSCOPE_EPOCH: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Debdiff,
    Diffoscope,
}

impl DiffKind {
    pub fn tool(&self) -> &'static str {
        match self {
            Self::Debdiff => "debdiff",
            Self::Diffoscope => "diffoscope",
        }
    }

    pub fn epoch(&self) -> &'static str {
        match self {
            Self::Debdiff => DEBDIFF_EPOCH,
            Self::Diffoscope => DIFFOSCOPE_EPOCH,
        }
    }
}

/// Serve a diff between two runs' artifacts, computing at most once per
/// key. Concurrent callers for the same key wait on the first computation
/// and read its cached bytes.
pub async fn get_diff(
    state: &SharedDiffer,
    kind: DiffKind,
    old_id: &str,
    new_id: &str,
    filter_boring: bool,
) -> Result<Vec<u8>, DifferError> {
    for run_id in [old_id, new_id] {
        let id = run_id.to_string();
        let known = state
            .db
            .call(move |db| db.get_run(&id))
            .await
            .map_err(DifferError::Other)?
            .is_some();
        if !known {
            return Err(DifferError::UnknownRun(run_id.to_string()));
        }
    }

    let key = cache_key(kind.tool(), kind.epoch(), old_id, new_id, filter_boring);
    if let Some(bytes) = state.cache.get(&key).await.map_err(DifferError::Other)? {
        METRICS.inc_diff_cache_hits();
        return Ok(bytes);
    }

    let lock = state.key_lock(&key).await;
    let _guard = lock.lock().await;
    // A racer may have filled the cache while this caller waited.
    if let Some(bytes) = state.cache.get(&key).await.map_err(DifferError::Other)? {
        METRICS.inc_diff_cache_hits();
        return Ok(bytes);
    }

    METRICS.inc_diff_cache_misses();
    let bytes = compute(state, kind, old_id, new_id, filter_boring).await?;
    // Transient failures never reach this point, so only good output is
    // ever cached.
    state
        .cache
        .put(&key, &bytes)
        .await
        .map_err(DifferError::Other)?;
    Ok(bytes)
}

async fn compute(
    state: &SharedDiffer,
    kind: DiffKind,
    old_id: &str,
    new_id: &str,
    filter_boring: bool,
) -> Result<Vec<u8>, DifferError> {
    let old_dir = tempfile::TempDir::new()
        .context("Failed to create scratch directory")
        .map_err(DifferError::Other)?;
    let new_dir = tempfile::TempDir::new()
        .context("Failed to create scratch directory")
        .map_err(DifferError::Other)?;

    state
        .artifacts
        .retrieve(old_id, old_dir.path())
        .await
        .map_err(|_| DifferError::ArtifactsMissing(old_id.to_string()))?;
    state
        .artifacts
        .retrieve(new_id, new_dir.path())
        .await
        .map_err(|_| DifferError::ArtifactsMissing(new_id.to_string()))?;

    let args = match kind {
        DiffKind::Debdiff => debdiff_args(old_dir.path(), new_dir.path())
            .map_err(DifferError::Other)?,
        DiffKind::Diffoscope => vec![
            old_dir.path().display().to_string(),
            new_dir.path().display().to_string(),
        ],
    };

    let stdout = run_tool(
        kind.tool(),
        &args,
        state.config.memory_limit_mb,
        state.config.cpu_time_secs,
        state.config.wall_clock_secs,
    )
    .await?;

    let output = if kind == DiffKind::Debdiff && filter_boring {
        filter_boring_debdiff(&String::from_utf8_lossy(&stdout)).into_bytes()
    } else {
        stdout
    };
    Ok(output)
}

/// debdiff compares .changes files when both runs produced one, and falls
/// back to comparing the binary packages directly.
fn debdiff_args(old_dir: &Path, new_dir: &Path) -> Result<Vec<String>> {
    let changes = |dir: &Path| -> Result<Option<String>> {
        for entry in std::fs::read_dir(dir).context("Failed to list artifacts")? {
            let entry = entry.context("Failed to read artifact entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".changes") {
                return Ok(Some(entry.path().display().to_string()));
            }
        }
        Ok(None)
    };
    if let (Some(old), Some(new)) = (changes(old_dir)?, changes(new_dir)?) {
        return Ok(vec![old, new]);
    }

    let debs = |dir: &Path| -> Result<Vec<String>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).context("Failed to list artifacts")? {
            let entry = entry.context("Failed to read artifact entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".deb") {
                found.push(entry.path().display().to_string());
            }
        }
        found.sort();
        Ok(found)
    };
    let mut args = vec!["--from".to_string()];
    args.extend(debs(old_dir)?);
    args.push("--to".to_string());
    args.extend(debs(new_dir)?);
    Ok(args)
}

/// Run a diff tool with an address-space cap, a CPU-time cap, and a
/// wall-clock kill. Exit status 1 means "differences found" for both
/// tools and is success here.
async fn run_tool(
    tool: &str,
    args: &[String],
    memory_limit_mb: u64,
    cpu_time_secs: u64,
    wall_clock_secs: u64,
) -> Result<Vec<u8>, DifferError> {
    let mut command = tokio::process::Command::new(tool);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        let memory_bytes = memory_limit_mb.saturating_mul(1024 * 1024);
        unsafe {
            command.pre_exec(move || {
                let mem = libc::rlimit {
                    rlim_cur: memory_bytes,
                    rlim_max: memory_bytes,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let cpu = libc::rlimit {
                    rlim_cur: cpu_time_secs,
                    rlim_max: cpu_time_secs,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {tool}"))
        .map_err(DifferError::Other)?;

    let waited = tokio::time::timeout(
        Duration::from_secs(wall_clock_secs),
        collect_output(&mut child),
    )
    .await;
    match waited {
        Ok(Ok((status, stdout))) => match status.code() {
            Some(0) | Some(1) => Ok(stdout),
            Some(code) => Err(DifferError::ToolFailed {
                tool: tool.to_string(),
                status: code,
            }),
            None => Err(DifferError::ToolFailed {
                tool: tool.to_string(),
                status: -1,
            }),
        },
        Ok(Err(err)) => Err(DifferError::Other(err)),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(DifferError::Timeout {
                tool: tool.to_string(),
                limit_secs: wall_clock_secs,
            })
        }
    }
}

async fn collect_output(
    child: &mut tokio::process::Child,
) -> Result<(std::process::ExitStatus, Vec<u8>)> {
    let mut stdout_pipe = child
        .stdout
        .take()
        .context("Child stdout was not captured")?;
    let mut stdout = Vec::new();
    stdout_pipe
        .read_to_end(&mut stdout)
        .await
        .context("Failed to read tool output")?;
    let status = child.wait().await.context("Failed to wait for tool")?;
    Ok((status, stdout))
}

/// Drop debdiff sections that only restate the version bump: changelog
/// hunks and the control-file Version line.
pub fn filter_boring_debdiff(text: &str) -> String {
    let mut out = Vec::new();
    let mut skipping_file = false;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            skipping_file = rest.contains("/changelog");
        } else if line.starts_with("diff ") {
            skipping_file = line.contains("/changelog");
        }
        if skipping_file {
            continue;
        }
        if line.starts_with("Version: ") || line.starts_with("-Version: ")
            || line.starts_with("+Version: ")
        {
            continue;
        }
        out.push(line);
    }
    let mut joined = out.join("\n");
    if text.ends_with('\n') && !joined.is_empty() {
        joined.push('\n');
    }
    joined
}
