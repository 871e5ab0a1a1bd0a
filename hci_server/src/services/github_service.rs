//! GitHub integration: webhook validation and check-suite / check-run reporting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::github_auth::GithubAuth;
use crate::models::build::{CheckRunRef, CheckSuiteRef, RunStatus, SuiteStatus};

type HmacSha256 = Hmac<Sha256>;

/// Check-run output text limit enforced by GitHub.
const MAX_CHECK_TEXT: usize = 65_000;
/// Commit status description limit enforced by GitHub.
const MAX_STATUS_DESCRIPTION: usize = 140;
const STATUS_CONTEXT: &str = "tinyhci";
pub(crate) const USER_AGENT: &str = "tinyhci";

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("check reporting disabled (no credentials)")]
    Disabled,
    #[error("GitHub App JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("GitHub request timed out after {0:?}")]
    Timeout(Duration),
    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Publishes build progress to the source-control provider.
///
/// Calls are fire-and-report: the coordinator logs failures and moves on.
#[async_trait]
pub trait CheckReporter: Send + Sync {
    async fn create_check_suite(&self, sha: &str) -> Result<CheckSuiteRef, ReportError>;

    async fn set_check_suite_status(
        &self,
        sha: &str,
        status: SuiteStatus,
        detail: &str,
    ) -> Result<(), ReportError>;

    /// Create the check-run for `target`, or update `existing`.
    async fn create_or_update_check_run(
        &self,
        sha: &str,
        target: &str,
        existing: Option<CheckRunRef>,
        status: RunStatus,
        detail: &str,
    ) -> Result<CheckRunRef, ReportError>;
}

/// Check reporter backed by the GitHub REST API.
#[derive(Clone)]
pub struct GithubChecks {
    client: reqwest::Client,
    api_url: String,
    repo: String,
    auth: Arc<GithubAuth>,
}

impl GithubChecks {
    pub fn new(api_url: &str, repo: &str, auth: GithubAuth, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build GitHub client, using defaults: {e}");
                reqwest::Client::new()
            });
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            auth: Arc::new(auth),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ReportError> {
        let token = self.auth.token(&self.client, &self.api_url).await?;
        let url = format!("{}/repos/{}/{}", self.api_url, self.repo, path);
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value, ReportError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReportError::Api { status, body });
        }
        Ok(resp.json().await.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl CheckReporter for GithubChecks {
    async fn create_check_suite(&self, sha: &str) -> Result<CheckSuiteRef, ReportError> {
        let req = self
            .request(reqwest::Method::POST, "check-suites")
            .await?
            .json(&serde_json::json!({ "head_sha": sha }));
        let body = self.send(req).await?;
        Ok(CheckSuiteRef(body["id"].as_u64().unwrap_or_default()))
    }

    async fn set_check_suite_status(
        &self,
        sha: &str,
        status: SuiteStatus,
        detail: &str,
    ) -> Result<(), ReportError> {
        let req = self
            .request(reqwest::Method::POST, &format!("statuses/{sha}"))
            .await?
            .json(&commit_status_body(status, detail));
        self.send(req).await?;
        Ok(())
    }

    async fn create_or_update_check_run(
        &self,
        sha: &str,
        target: &str,
        existing: Option<CheckRunRef>,
        status: RunStatus,
        detail: &str,
    ) -> Result<CheckRunRef, ReportError> {
        let body = check_run_body(sha, target, status, detail);
        let req = match existing {
            Some(CheckRunRef(id)) => {
                self.request(reqwest::Method::PATCH, &format!("check-runs/{id}"))
                    .await?
            }
            None => self.request(reqwest::Method::POST, "check-runs").await?,
        };
        let resp = self.send(req.json(&body)).await?;
        let id = resp["id"]
            .as_u64()
            .or(existing.map(|r| r.0))
            .unwrap_or_default();
        Ok(CheckRunRef(id))
    }
}

/// Commit status payload standing in for the suite's aggregate state.
fn commit_status_body(status: SuiteStatus, detail: &str) -> serde_json::Value {
    let state = match status {
        SuiteStatus::Pending | SuiteStatus::InProgress => "pending",
        SuiteStatus::Passed => "success",
        SuiteStatus::Failed => "failure",
    };
    let first_line = detail.lines().next().unwrap_or_default();
    let description: String = first_line.chars().take(MAX_STATUS_DESCRIPTION).collect();
    serde_json::json!({
        "state": state,
        "description": description,
        "context": STATUS_CONTEXT,
    })
}

fn check_run_body(sha: &str, target: &str, status: RunStatus, detail: &str) -> serde_json::Value {
    let (state, conclusion, title) = match status {
        RunStatus::Pending | RunStatus::Queued => ("queued", None, "Waiting for the board"),
        RunStatus::Flashing => ("in_progress", None, "Flashing"),
        RunStatus::Testing => ("in_progress", None, "Testing"),
        RunStatus::Passed => ("completed", Some("success"), "Tests passed"),
        RunStatus::Failed => ("completed", Some("failure"), "Tests failed"),
    };

    let mut body = serde_json::json!({
        "name": target,
        "head_sha": sha,
        "status": state,
        "output": {
            "title": title,
            "summary": format!("{target}: {status}"),
            "text": super::truncate_output(detail, MAX_CHECK_TEXT),
        },
    });
    if let Some(conclusion) = conclusion {
        body["conclusion"] = serde_json::Value::String(conclusion.to_string());
    }
    body
}
