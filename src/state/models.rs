use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named upstream source unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Codebase {
    /// Immutable lowercase identifier.
    pub name: String,
    pub vcs_type: VcsType,
    pub branch_url: String,
    pub subpath: Option<String>,
    pub web_url: Option<String>,
    /// Priority weight, > 0. Higher values schedule earlier.
    pub value: i64,
    pub inactive: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VcsType {
    Git,
    Bzr,
}

impl VcsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Bzr => "bzr",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "git" => Ok(Self::Git),
            "bzr" => Ok(Self::Bzr),
            _ => Err(format!("Invalid vcs type: {}", s)),
        }
    }
}

/// A standing intent to run a campaign against a codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub codebase: String,
    pub campaign: String,
    pub change_set: Option<String>,
    pub command: String,
    pub context: Option<String>,
    pub value: Option<i64>,
    pub success_chance: Option<f64>,
    /// Name of the publish policy governing this candidate's runs.
    pub policy: String,
}

/// Ordering class for queue items. Classes sort before priorities: every
/// item in an earlier bucket is assigned before any item in a later one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueueBucket {
    UpdateExistingMp,
    Manual,
    Control,
    Hook,
    Reschedule,
    UpdateNewMp,
    MissingDeps,
    Default,
}

impl QueueBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateExistingMp => "update-existing-mp",
            Self::Manual => "manual",
            Self::Control => "control",
            Self::Hook => "hook",
            Self::Reschedule => "reschedule",
            Self::UpdateNewMp => "update-new-mp",
            Self::MissingDeps => "missing-deps",
            Self::Default => "default",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "update-existing-mp" => Ok(Self::UpdateExistingMp),
            "manual" => Ok(Self::Manual),
            "control" => Ok(Self::Control),
            "hook" => Ok(Self::Hook),
            "reschedule" => Ok(Self::Reschedule),
            "update-new-mp" => Ok(Self::UpdateNewMp),
            "missing-deps" => Ok(Self::MissingDeps),
            "default" => Ok(Self::Default),
            _ => Err(format!("Invalid queue bucket: {}", s)),
        }
    }

    /// Position in the ordering; lower sorts earlier.
    pub fn ordinal(&self) -> i64 {
        match self {
            Self::UpdateExistingMp => 0,
            Self::Manual => 1,
            Self::Control => 2,
            Self::Hook => 3,
            Self::Reschedule => 4,
            Self::UpdateNewMp => 5,
            Self::MissingDeps => 6,
            Self::Default => 7,
        }
    }
}

/// A concrete, pending work assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    /// Lower = earlier, within the bucket.
    pub priority: i64,
    pub bucket: QueueBucket,
    pub estimated_duration_secs: Option<i64>,
    pub change_set: Option<String>,
    pub requester: Option<String>,
    /// Discard any resume baseline when computing the assignment payload.
    pub refresh: bool,
}

/// How the runner reaches a worker for liveness checks and kill requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backchannel {
    /// Worker exposes its own HTTP endpoint; the runner polls `my_url`.
    Polling { my_url: String },
    /// Worker runs inside a Jenkins build; the runner polls the build URL.
    Jenkins { build_url: String },
}

/// A queue item currently leased to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRun {
    /// Opaque id minted at lease time; becomes the run id on finish.
    pub log_id: String,
    pub queue_id: i64,
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub worker: String,
    pub backchannel: Option<Backchannel>,
    pub start_time: DateTime<Utc>,
    pub estimated_duration_secs: i64,
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive watchdog sweeps that failed to reach the worker.
    pub mia_count: i64,
    /// Snapshot of the codebase VCS info taken at lease time.
    pub vcs_info: serde_json::Value,
    pub change_set: Option<String>,
    /// Run id this assignment resumes from, if any.
    pub resume_from: Option<String>,
    pub refresh: bool,
}

/// Review verdict attached to a run; gates publishing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PublishStatus {
    Unknown,
    Blocked,
    NeedsManualReview,
    Rejected,
    Approved,
    Ignored,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Blocked => "blocked",
            Self::NeedsManualReview => "needs-manual-review",
            Self::Rejected => "rejected",
            Self::Approved => "approved",
            Self::Ignored => "ignored",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "blocked" => Ok(Self::Blocked),
            "needs-manual-review" => Ok(Self::NeedsManualReview),
            "rejected" => Ok(Self::Rejected),
            "approved" => Ok(Self::Approved),
            "ignored" => Ok(Self::Ignored),
            _ => Err(format!("Invalid publish status: {}", s)),
        }
    }
}

/// The historical record of an attempted build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Same id as the lease that produced it.
    pub id: String,
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub result_code: String,
    pub failure_stage: Option<String>,
    pub failure_transient: Option<bool>,
    pub description: Option<String>,
    /// Resulting revision of the main branch role; opaque string.
    pub revision: Option<String>,
    /// Head revision of the target branch at assignment time.
    pub main_branch_revision: Option<String>,
    pub worker: Option<String>,
    pub logfilenames: Vec<String>,
    /// Free-form worker payload (codemod output, builder result, context).
    pub result: Option<serde_json::Value>,
    pub value: Option<i64>,
    pub publish_status: PublishStatus,
    /// Run id this run resumed from. Required when result_code is
    /// `nothing-new-to-do`.
    pub resume_from: Option<String>,
    pub change_set: Option<String>,
}

/// A (role, revision) pair produced by a run. `absorbed` flips to true once
/// the branch has been merged or pushed upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBranch {
    pub run_id: String,
    pub role: String,
    pub remote_name: Option<String>,
    pub base_revision: Option<String>,
    pub revision: Option<String>,
    pub absorbed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PublishMode {
    Push,
    AttemptPush,
    Propose,
    BuildOnly,
    PushDerived,
    Skip,
    Bts,
}

impl PublishMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::AttemptPush => "attempt-push",
            Self::Propose => "propose",
            Self::BuildOnly => "build-only",
            Self::PushDerived => "push-derived",
            Self::Skip => "skip",
            Self::Bts => "bts",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "push" => Ok(Self::Push),
            "attempt-push" => Ok(Self::AttemptPush),
            "propose" => Ok(Self::Propose),
            "build-only" => Ok(Self::BuildOnly),
            "push-derived" => Ok(Self::PushDerived),
            "skip" => Ok(Self::Skip),
            "bts" => Ok(Self::Bts),
        _ => Err(format!("Invalid publish mode: {}", s)),
        }
    }

    /// Modes that never produce a publishable branch.
    pub fn is_inert(&self) -> bool {
        matches!(self, Self::Skip | Self::BuildOnly)
    }
}

/// An attempted push/propose of a run's branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publish {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub change_set: Option<String>,
    pub codebase: String,
    pub campaign: String,
    pub role: Option<String>,
    pub mode: PublishMode,
    pub source_branch_url: Option<String>,
    pub target_branch_url: Option<String>,
    pub revision: Option<String>,
    pub merge_proposal_url: Option<String>,
    pub result_code: String,
    pub description: Option<String>,
    pub requester: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MergeProposalStatus {
    Open,
    Closed,
    Merged,
    Applied,
    Abandoned,
    Rejected,
}

impl MergeProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
            Self::Applied => "applied",
            Self::Abandoned => "abandoned",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "merged" => Ok(Self::Merged),
            "applied" => Ok(Self::Applied),
            "abandoned" => Ok(Self::Abandoned),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid merge proposal status: {}", s)),
        }
    }
}

/// A live or historical pull/merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeProposal {
    pub url: String,
    pub codebase: Option<String>,
    pub target_branch_url: Option<String>,
    pub status: MergeProposalStatus,
    pub revision: Option<String>,
    pub merged_by: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
    pub last_scanned: Option<DateTime<Utc>>,
    pub can_be_merged: Option<bool>,
    pub rate_limit_bucket: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSetState {
    Created,
    Working,
    Ready,
    Publishing,
    Done,
}

impl ChangeSetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Working => "working",
            Self::Ready => "ready",
            Self::Publishing => "publishing",
            Self::Done => "done",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "created" => Ok(Self::Created),
            "working" => Ok(Self::Working),
            "ready" => Ok(Self::Ready),
            "publishing" => Ok(Self::Publishing),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid change set state: {}", s)),
        }
    }
}

/// A grouping of related runs and publishes across codebases. State is a
/// pure function of the store, recomputed on every relevant commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub state: ChangeSetState,
}

/// One role's rule within a named publish policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub role: String,
    pub mode: PublishMode,
    pub frequency_days: Option<i64>,
    pub rate_limit_bucket: Option<String>,
    /// Open-proposal cap for the bucket; NULL uses the configured default.
    pub max_open_mps: Option<i64>,
}

/// An enrolled worker; credentials checked on every worker-facing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub link: Option<String>,
}

/// Stable result-code strings shared across components.
pub mod result_code {
    pub const SUCCESS: &str = "success";
    pub const NOTHING_TO_DO: &str = "nothing-to-do";
    pub const NOTHING_NEW_TO_DO: &str = "nothing-new-to-do";
    pub const WORKER_FAILURE: &str = "worker-failure";
    pub const WORKER_TIMEOUT: &str = "worker-timeout";
    pub const KILLED: &str = "killed";
    pub const BRANCH_UNAVAILABLE: &str = "branch-unavailable";

    /// Default transience for codes the worker did not classify itself.
    pub fn default_transient(code: &str) -> bool {
        matches!(code, WORKER_TIMEOUT | WORKER_FAILURE | BRANCH_UNAVAILABLE)
    }
}
