//! In-memory collaborator doubles for coordinator and route tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::artifact_service::ArtifactBuilder;
use super::board_driver::BoardDriver;
use super::board_registry::BoardRegistry;
use super::coordinator::{BuildQueue, Coordinator, Timing};
use super::github_service::{CheckReporter, ReportError};
use super::StepOutput;
use crate::config::HciConfig;
use crate::models::board::Board;
use crate::models::build::{CheckRunRef, CheckSuiteRef, RunStatus, SuiteStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    SuiteCreated(String),
    Suite(String, SuiteStatus, String),
    Run(String, String, RunStatus, String),
}

/// Records every call instead of talking to GitHub.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    calls: Mutex<Vec<Report>>,
    created_runs: Mutex<Vec<(String, String)>>,
    next_id: AtomicU64,
    pending_run_delay: Duration,
    final_suite_delay: Duration,
    hang_on_suite: Option<SuiteStatus>,
}

impl RecordingReporter {
    /// Pending check-run reports take `delay` to complete.
    pub fn with_pending_run_delay(delay: Duration) -> Self {
        Self {
            pending_run_delay: delay,
            ..Default::default()
        }
    }

    /// Passed/Failed suite reports take `delay` to complete.
    pub fn with_final_suite_delay(delay: Duration) -> Self {
        Self {
            final_suite_delay: delay,
            ..Default::default()
        }
    }

    /// Suite reports for `status` never complete.
    pub fn hanging_on_suite(status: SuiteStatus) -> Self {
        Self {
            hang_on_suite: Some(status),
            ..Default::default()
        }
    }

    /// Check-runs created (not updated) for `target`.
    pub fn check_runs_created(&self, sha: &str, target: &str) -> usize {
        self.created_runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, t)| s == sha && t == target)
            .count()
    }

    pub fn calls(&self) -> Vec<Report> {
        self.calls.lock().unwrap().clone()
    }

    pub fn suites_created(&self, sha: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Report::SuiteCreated(s) if s == sha))
            .count()
    }

    pub fn last_suite(&self, sha: &str) -> Option<(SuiteStatus, String)> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Report::Suite(s, status, detail) if s == sha => Some((status, detail)),
            _ => None,
        })
    }

    pub fn run_statuses(&self, sha: &str, target: &str) -> Vec<RunStatus> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Report::Run(s, t, status, _) if s == sha && t == target => Some(status),
                _ => None,
            })
            .collect()
    }

    fn record(&self, report: Report) {
        self.calls.lock().unwrap().push(report);
    }
}

#[async_trait]
impl CheckReporter for RecordingReporter {
    async fn create_check_suite(&self, sha: &str) -> Result<CheckSuiteRef, ReportError> {
        self.record(Report::SuiteCreated(sha.to_string()));
        Ok(CheckSuiteRef(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn set_check_suite_status(
        &self,
        sha: &str,
        status: SuiteStatus,
        detail: &str,
    ) -> Result<(), ReportError> {
        self.record(Report::Suite(sha.to_string(), status, detail.to_string()));
        if self.hang_on_suite == Some(status) {
            std::future::pending::<()>().await;
        }
        if status.is_terminal() && !self.final_suite_delay.is_zero() {
            tokio::time::sleep(self.final_suite_delay).await;
        }
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
        self.record(Report::Run(
            sha.to_string(),
            target.to_string(),
            status,
            detail.to_string(),
        ));
        if status == RunStatus::Pending && !self.pending_run_delay.is_zero() {
            tokio::time::sleep(self.pending_run_delay).await;
        }
        match existing {
            Some(run_ref) => Ok(run_ref),
            None => {
                self.created_runs
                    .lock()
                    .unwrap()
                    .push((sha.to_string(), target.to_string()));
                Ok(CheckRunRef(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
            }
        }
    }
}

/// Toolchain builder that succeeds unless told otherwise.
#[derive(Debug, Default)]
pub struct FakeBuilder {
    pub failure: Option<String>,
    pub panics: bool,
    pub calls: AtomicUsize,
}

impl FakeBuilder {
    pub fn failing(log: &str) -> Self {
        Self {
            failure: Some(log.to_string()),
            ..Default::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactBuilder for FakeBuilder {
    async fn build(&self, _sha: &str, binary_url: &str) -> StepOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("toolchain unpacker crashed on {binary_url}");
        }
        match &self.failure {
            Some(log) => StepOutput::failure(log.clone()),
            None => StepOutput::success(format!("installed {binary_url}")),
        }
    }
}

/// Board driver that logs every step and tracks how many hold the board at once.
#[derive(Debug, Default)]
pub struct FakeDriver {
    flash_failures: HashSet<String>,
    test_failures: HashSet<String>,
    hang_on_flash: HashSet<String>,
    hang_on_test: HashSet<String>,
    panic_on_flash: HashSet<String>,
    step_delay: Duration,
    log: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeDriver {
    pub fn failing_flash(target: &str) -> Self {
        Self {
            flash_failures: [target.to_string()].into(),
            ..Default::default()
        }
    }

    pub fn failing_test(target: &str) -> Self {
        Self {
            test_failures: [target.to_string()].into(),
            ..Default::default()
        }
    }

    pub fn hanging_flash(target: &str) -> Self {
        Self {
            hang_on_flash: [target.to_string()].into(),
            ..Default::default()
        }
    }

    pub fn hanging_test(target: &str) -> Self {
        Self {
            hang_on_test: [target.to_string()].into(),
            ..Default::default()
        }
    }

    pub fn panicking_flash(target: &str) -> Self {
        Self {
            panic_on_flash: [target.to_string()].into(),
            ..Default::default()
        }
    }

    /// Every flash and test holds the board for `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            step_delay: delay,
            ..Default::default()
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn hold(&self, entry: String, delay: Duration) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("{entry}:start"));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.log.lock().unwrap().push(format!("{entry}:end"));
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BoardDriver for FakeDriver {
    async fn flash(&self, board: &Board, sha: &str) -> StepOutput {
        if self.panic_on_flash.contains(&board.target) {
            panic!("driver lost {}", board.device);
        }
        let delay = if self.hang_on_flash.contains(&board.target) {
            Duration::from_secs(3600)
        } else {
            self.step_delay
        };
        self.hold(format!("flash:{}:{sha}", board.target), delay).await;
        if self.flash_failures.contains(&board.target) {
            StepOutput::failure(format!("error: no device on {}", board.device))
        } else {
            StepOutput::success("flashed")
        }
    }

    async fn test(&self, board: &Board) -> StepOutput {
        let delay = if self.hang_on_test.contains(&board.target) {
            Duration::from_secs(3600)
        } else {
            self.step_delay
        };
        self.hold(format!("test:{}", board.target), delay).await;
        if self.test_failures.contains(&board.target) {
            StepOutput::failure("PASS gpio\nFAIL uart")
        } else {
            StepOutput::success("PASS gpio\nPASS uart")
        }
    }
}

/// Configuration with no GitHub credentials and no artifact sources.
pub fn test_config() -> HciConfig {
    HciConfig {
        github_repo: "tinygo-org/tinygo".to_string(),
        github_webhook_secret: String::new(),
        buildhook_secret: String::new(),
        github_token: String::new(),
        github_app_id: None,
        github_installation_id: None,
        github_key_file: None,
        github_api_url: "http://127.0.0.1:1".to_string(),
        default_artifact_url: None,
        artifact_api_url: "http://127.0.0.1:1/{build_num}/artifacts".to_string(),
        work_dir: std::env::temp_dir().join("tinyhci-test").display().to_string(),
        install_prefix: std::env::temp_dir().join("tinyhci-test").display().to_string(),
        settle_secs: 0,
        flash_timeout_secs: 5,
        test_timeout_secs: 5,
        build_timeout_secs: 5,
        report_timeout_secs: 5,
        retention_hours: 1,
        evict_interval_secs: 60,
    }
}

/// Coordinator over the builtin boards with every collaborator faked.
pub fn test_coordinator() -> (Arc<Coordinator>, BuildQueue, Arc<RecordingReporter>) {
    let reporter = Arc::new(RecordingReporter::default());
    let (coordinator, queue) = Coordinator::new(
        Arc::new(BoardRegistry::builtin()),
        reporter.clone(),
        Arc::new(FakeBuilder::default()),
        Arc::new(FakeDriver::default()),
        Timing {
            settle: Duration::ZERO,
            flash_timeout: Duration::from_secs(5),
            test_timeout: Duration::from_secs(5),
            report_timeout: Duration::from_secs(5),
        },
    );
    (coordinator, queue, reporter)
}
