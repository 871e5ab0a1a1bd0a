//! Read-only JSON views of the build index, plus manual reruns.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::build::BuildEvent;
use crate::models::build::{Build, RunStatus, SuiteStatus};
use crate::services::coordinator::{Coordinator, CoordinatorError};

/// JSON response for a build with its runs.
#[derive(Debug, Serialize)]
pub struct BuildJson {
    pub sha: String,
    pub binary_url: Option<String>,
    pub check_suite_id: Option<u64>,
    pub suite_status: Option<SuiteStatus>,
    pub queued: bool,
    pub processing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runs: Vec<RunJson>,
}

#[derive(Debug, Serialize)]
pub struct RunJson {
    pub target: String,
    pub status: RunStatus,
    pub check_run_id: Option<u64>,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthJson {
    pub status: &'static str,
    pub builds: usize,
    pub queue_depth: usize,
    pub boards: Vec<String>,
}

impl From<Build> for BuildJson {
    fn from(build: Build) -> Self {
        Self {
            sha: build.sha,
            binary_url: build.binary_url,
            check_suite_id: build.check_suite.map(|s| s.0),
            suite_status: build.suite_status,
            queued: build.queued,
            processing: build.processing,
            created_at: build.created_at,
            updated_at: build.updated_at,
            finished_at: build.finished_at,
            runs: build
                .runs
                .into_values()
                .map(|r| RunJson {
                    target: r.target,
                    status: r.status,
                    check_run_id: r.check_run.map(|c| c.0),
                    detail: r.detail,
                    updated_at: r.updated_at,
                })
                .collect(),
        }
    }
}

/// Most recently created builds, newest first.
pub async fn list_builds(coordinator: &Coordinator, limit: usize) -> Vec<BuildJson> {
    coordinator
        .index()
        .list()
        .await
        .into_iter()
        .take(limit)
        .map(BuildJson::from)
        .collect()
}

pub async fn get_build(coordinator: &Coordinator, sha: &str) -> Option<BuildJson> {
    coordinator.index().get(sha).await.map(BuildJson::from)
}

/// Ask for `target` to be (re)tested on `sha`, as a check-run rerequest would.
pub async fn request_run(
    coordinator: &Coordinator,
    sha: &str,
    target: &str,
) -> Result<BuildJson, CoordinatorError> {
    coordinator
        .handle(BuildEvent::RunRequested {
            sha: sha.to_string(),
            target: target.to_string(),
        })
        .await?;
    get_build(coordinator, sha)
        .await
        .ok_or_else(|| CoordinatorError::UnknownTarget(target.to_string()))
}

pub async fn health(coordinator: &Coordinator) -> HealthJson {
    HealthJson {
        status: "ok",
        builds: coordinator.index().len().await,
        queue_depth: coordinator.queue_depth(),
        boards: coordinator.registry().targets(),
    }
}
