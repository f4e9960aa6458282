//! VCS publish collaborator interface.
//!
//! The publisher never touches branches itself; it drives an external
//! service that owns the VCS stores and forge credentials. The trait
//! covers the three operations the merge-proposal lifecycle needs:
//! publishing a branch, reading a proposal's forge state, and closing a
//! proposal with a comment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PublishError;
use crate::state::models::{MergeProposalStatus, PublishMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub mode: PublishMode,
    pub codebase: String,
    pub campaign: String,
    pub role: String,
    pub target_branch_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_branch_url: Option<String>,
    pub revision: String,
    pub commit_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debdiff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOutcome {
    #[serde(default)]
    pub proposal_url: Option<String>,
    /// False when an existing proposal was refreshed in place.
    #[serde(default)]
    pub is_new: bool,
    pub branch_name: String,
    pub description: String,
}

/// Forge-reported proposal state, as returned by `proposal_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalStatus {
    pub status: MergeProposalStatus,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub merged_by: Option<String>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub can_be_merged: Option<bool>,
}

#[async_trait]
pub trait VcsPublisher: Send + Sync {
    /// Push or propose one branch. The source branch must exist in the
    /// VCS store at `revision`.
    async fn publish_one(&self, req: &PublishRequest) -> Result<PublishOutcome, PublishError>;

    /// Current forge state of a proposal.
    async fn proposal_status(&self, url: &str) -> Result<ProposalStatus, PublishError>;

    /// Post a comment and close the proposal on the forge.
    async fn close_proposal(&self, url: &str, comment: &str) -> Result<(), PublishError>;
}

/// HTTP client for the publish collaborator service.
pub struct HttpVcsPublisher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpVcsPublisher {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn map_status(status: reqwest::StatusCode, retry_after: Option<u64>) -> PublishError {
        match status.as_u16() {
            401 => PublishError::AuthenticationFailed("publish service rejected credentials".into()),
            403 => PublishError::ForgeLoginRequired,
            404 => PublishError::BranchUnavailable("branch not found in VCS store".into()),
            409 => PublishError::BranchBusy("target branch has concurrent activity".into()),
            429 => PublishError::BranchRateLimited {
                retry_after_secs: retry_after,
            },
            code => PublishError::UnexpectedHttpStatus(code),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, PublishError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Err(Self::map_status(resp.status(), retry_after))
    }
}

#[async_trait]
impl VcsPublisher for HttpVcsPublisher {
    async fn publish_one(&self, req: &PublishRequest) -> Result<PublishOutcome, PublishError> {
        let resp = self
            .client
            .post(format!("{}/publish", self.base_url))
            .json(req)
            .send()
            .await
            .map_err(|e| PublishError::NetworkError(e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))
    }

    async fn proposal_status(&self, url: &str) -> Result<ProposalStatus, PublishError> {
        let resp = self
            .client
            .get(format!("{}/proposal", self.base_url))
            .query(&[("url", url)])
            .send()
            .await
            .map_err(|e| PublishError::NetworkError(e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))
    }

    async fn close_proposal(&self, url: &str, comment: &str) -> Result<(), PublishError> {
        let resp = self
            .client
            .post(format!("{}/proposal/close", self.base_url))
            .json(&serde_json::json!({"url": url, "comment": comment}))
            .send()
            .await
            .map_err(|e| PublishError::NetworkError(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }
}
