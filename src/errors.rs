//! Typed error hierarchy for the Custodian control plane.
//!
//! Three top-level enums cover the three components:
//! - `RunnerError` — queue, assignment, and result-ingestion failures
//! - `PublishError` — publish execution and forge-interaction failures
//! - `DifferError` — artifact-diff computation failures

use thiserror::Error;

/// Errors from the runner subsystem (queue, leases, ingestion).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no queue item is eligible for assignment")]
    EmptyQueue,

    #[error("assignment raced with another worker and retries were exhausted")]
    AssignmentFailed,

    #[error("no active run with id {0}")]
    UnknownRun(String),

    #[error("run {0} has already been finished")]
    AlreadyFinished(String),

    #[error("{codebase}/{campaign} is already queued")]
    DuplicateSchedule { codebase: String, campaign: String },

    #[error("unknown codebase {0}")]
    UnknownCodebase(String),

    #[error("invalid worker result: {0}")]
    InvalidResult(String),

    #[error("log file name {0} is not permitted")]
    InvalidLogName(String),

    #[error("log upload failed: {0}")]
    UploadFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from publish execution against a forge or VCS store.
///
/// The string codes returned by [`PublishError::code`] are recorded verbatim
/// on publish rows and must stay stable; downstream tooling matches on them.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("forge requires an interactive login")]
    ForgeLoginRequired,

    #[error("branch is rate-limited by the forge")]
    BranchRateLimited { retry_after_secs: Option<u64> },

    #[error("branch is busy: {0}")]
    BranchBusy(String),

    #[error("branch unavailable: {0}")]
    BranchUnavailable(String),

    #[error("no run found for merge proposal {0}")]
    NoRunForMp(String),

    #[error("unexpected HTTP status {0}")]
    UnexpectedHttpStatus(u16),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("invalid response from collaborator: {0}")]
    InvalidResponse(String),

    #[error("no run with id {0}")]
    UnknownRun(String),

    #[error("no publish policy named {0}")]
    UnknownPolicy(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PublishError {
    /// Stable result_code string recorded on failed publish rows.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication-failed",
            Self::ForgeLoginRequired => "forge-login-required",
            Self::BranchRateLimited { .. } => "branch-rate-limited",
            Self::BranchBusy(_) => "branch-busy",
            Self::BranchUnavailable(_) => "branch-unavailable",
            Self::NoRunForMp(_) => "no-run-for-mp",
            Self::UnexpectedHttpStatus(_) => "unexpected-http-status",
            Self::NetworkError(_) => "network-error",
            Self::InvalidResponse(_) => "invalid-response",
            Self::UnknownRun(_) => "unknown-run",
            Self::UnknownPolicy(_) => "unknown-policy",
            Self::Other(_) => "internal-error",
        }
    }

    /// Transient errors contribute to backoff and are retried by the next
    /// periodic sweep; permanent errors wait for operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BranchRateLimited { .. }
                | Self::BranchBusy(_)
                | Self::UnexpectedHttpStatus(_)
                | Self::NetworkError(_)
        )
    }
}

/// Errors from the differ subsystem.
#[derive(Debug, Error)]
pub enum DifferError {
    #[error("no run with id {0}")]
    UnknownRun(String),

    #[error("artifacts for run {0} are not retrievable")]
    ArtifactsMissing(String),

    #[error("unsupported media type {0}")]
    UnsupportedMediaType(String),

    #[error("{tool} exited with status {status}")]
    ToolFailed { tool: String, status: i32 },

    #[error("{tool} exceeded the {limit_secs}s wall-clock limit")]
    Timeout { tool: String, limit_secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
