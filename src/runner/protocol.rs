//! Wire types exchanged with workers.
//!
//! Free-form sections (`codemod`, `details`, `builder_result`, `context`)
//! stay as raw JSON; only the well-typed subset is validated here. The
//! read side tolerates unknown extra fields throughout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response body of `assign` and `peek`. `id` is absent for peeks, which
/// do not lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub description: String,
    pub queue_id: i64,
    pub estimated_duration_seconds: i64,
    pub branch: BranchInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<ResumeFrom>,
    /// Campaign-specific build parameters; opaque to the runner.
    pub build: serde_json::Value,
    pub force_build: bool,
    pub skip_setup_validation: bool,
    pub default_empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub url: String,
    pub vcs_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeFrom {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Body of `assign` requests: worker identity plus optional filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignRequest {
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub codebase: Option<String>,
    /// Worker's own HTTP endpoint; the runner polls it for liveness.
    #[serde(default)]
    pub my_url: Option<String>,
    #[serde(default)]
    pub jenkins_build_url: Option<String>,
}

/// Result envelope posted by a worker to `finish`.
///
/// `branches` entries are `[role, remote_name, base_revision, revision]`;
/// `tags` entries are `[name, revision]`. Revisions are opaque strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub codemod: Option<serde_json::Value>,
    #[serde(default)]
    pub main_branch_revision: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub value: Option<i64>,
    #[serde(default)]
    pub branches: Vec<(String, Option<String>, Option<String>, Option<String>)>,
    #[serde(default)]
    pub tags: Vec<(String, Option<String>)>,
    #[serde(default)]
    pub remotes: Option<serde_json::Value>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub builder_result: Option<serde_json::Value>,
    #[serde(default)]
    pub transient: Option<bool>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_result_parses_minimal_payload() {
        let result: WorkerResult = serde_json::from_str(r#"{"code": "success"}"#).unwrap();
        assert_eq!(result.code, "success");
        assert!(result.branches.is_empty());
        assert!(result.revision.is_none());
    }

    #[test]
    fn test_worker_result_parses_branch_tuples() {
        let result: WorkerResult = serde_json::from_str(
            r#"{
                "code": "success",
                "revision": "rev-b",
                "main_branch_revision": "rev-a",
                "branches": [["main", null, "rev-a", "rev-b"]],
                "tags": [["v1.0", "rev-b"]],
                "unknown_future_field": {"ignored": true}
            }"#,
        )
        .unwrap();
        assert_eq!(result.branches.len(), 1);
        let (role, remote, base, rev) = &result.branches[0];
        assert_eq!(role, "main");
        assert!(remote.is_none());
        assert_eq!(base.as_deref(), Some("rev-a"));
        assert_eq!(rev.as_deref(), Some("rev-b"));
        assert_eq!(result.tags[0].0, "v1.0");
    }

    #[test]
    fn test_assignment_skips_absent_fields() {
        let assignment = Assignment {
            id: None,
            codebase: "foo".into(),
            campaign: "lintian-fixes".into(),
            command: "lintian-brush".into(),
            description: "lintian-fixes on foo".into(),
            queue_id: 7,
            estimated_duration_seconds: 600,
            branch: BranchInfo {
                url: "https://vcs.example/foo".into(),
                vcs_type: "git".into(),
                subpath: None,
                cached_url: None,
            },
            resume_from: None,
            build: serde_json::json!({}),
            force_build: false,
            skip_setup_validation: false,
            default_empty: false,
        };
        let json = serde_json::to_value(&assignment).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("resume_from").is_none());
        assert!(json["branch"].get("subpath").is_none());
    }
}
