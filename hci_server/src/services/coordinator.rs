//! Build lifecycle coordinator.
//!
//! Reduces webhook and buildhook events into one `Build` per commit and owns
//! the single worker that puts builds on the boards. The queue has exactly
//! one consumer, so at most one flash/test cycle runs at any instant.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::artifact_service::ArtifactBuilder;
use super::board_driver::BoardDriver;
use super::board_registry::BoardRegistry;
use super::build_index::BuildIndex;
use super::github_service::{CheckReporter, ReportError};
use super::StepOutput;
use crate::config::HciConfig;
use crate::events::build::BuildEvent;
use crate::models::board::Board;
use crate::models::build::{Build, RunRequest, RunStatus, SuiteStatus};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("unknown board target: {0}")]
    UnknownTarget(String),
    #[error("build queue closed")]
    QueueClosed,
}

/// Receiving end of the processing queue. Carries commit shas.
pub type BuildQueue = mpsc::UnboundedReceiver<String>;

/// Delays and deadlines around the board.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Wait between a successful flash and reading test output.
    pub settle: Duration,
    pub flash_timeout: Duration,
    pub test_timeout: Duration,
    /// Deadline for any single call to the check reporter.
    pub report_timeout: Duration,
}

impl Timing {
    pub fn from_config(config: &HciConfig) -> Self {
        Self {
            settle: config.settle(),
            flash_timeout: config.flash_timeout(),
            test_timeout: config.test_timeout(),
            report_timeout: config.report_timeout(),
        }
    }
}

/// What the worker should do next for a build it is processing.
enum Next {
    Target(String),
    Done { passed: bool, summary: String },
}

pub struct Coordinator {
    index: BuildIndex,
    registry: Arc<BoardRegistry>,
    reporter: Arc<dyn CheckReporter>,
    builder: Arc<dyn ArtifactBuilder>,
    driver: Arc<dyn BoardDriver>,
    timing: Timing,
    queue: mpsc::UnboundedSender<String>,
    depth: AtomicUsize,
    /// Serializes check-run reports so each run's ref is read and written back
    /// around a single provider call.
    run_reports: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<BoardRegistry>,
        reporter: Arc<dyn CheckReporter>,
        builder: Arc<dyn ArtifactBuilder>,
        driver: Arc<dyn BoardDriver>,
        timing: Timing,
    ) -> (Arc<Self>, BuildQueue) {
        // Unbounded: a handful of commits a day. Bound it before pointing
        // a busy repository at this.
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            index: BuildIndex::new(),
            registry,
            reporter,
            builder,
            driver,
            timing,
            queue: tx,
            depth: AtomicUsize::new(0),
            run_reports: Mutex::new(()),
        });
        (coordinator, rx)
    }

    pub fn index(&self) -> &BuildIndex {
        &self.index
    }

    pub fn registry(&self) -> &BoardRegistry {
        &self.registry
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    // ── Event reduction ──

    pub async fn handle(&self, event: BuildEvent) -> Result<(), CoordinatorError> {
        crate::metrics::event_reduced(event.kind());
        tracing::debug!(sha = event.sha(), kind = event.kind(), "Reducing event");

        match event {
            BuildEvent::CommitDiscovered { sha } => {
                self.commit_discovered(&sha).await;
                Ok(())
            }
            BuildEvent::RunRequested { sha, target } => self.run_requested(&sha, &target).await,
            BuildEvent::ArtifactReady { sha, url } => self.artifact_ready(&sha, &url).await,
        }
    }

    async fn commit_discovered(&self, sha: &str) {
        let first = self
            .index
            .get_or_create(sha, |b| {
                b.touch();
                if b.suite_status.is_none() {
                    b.suite_status = Some(SuiteStatus::Pending);
                    true
                } else {
                    false
                }
            })
            .await;

        tracing::info!(sha, "Commit discovered");
        self.ensure_check_suite(sha).await;
        if first {
            self.report_suite(sha, SuiteStatus::Pending, "Waiting for toolchain build")
                .await;
        }
    }

    async fn run_requested(&self, sha: &str, target: &str) -> Result<(), CoordinatorError> {
        if !self.registry.contains(target) {
            tracing::warn!(sha, board = target, "Run requested for unknown board, dropping");
            return Err(CoordinatorError::UnknownTarget(target.to_string()));
        }

        let (request, reopen, ready) = self
            .index
            .get_or_create(sha, |b| {
                let request = b.request_run(target);
                let reopen = matches!(request, RunRequest::Inserted | RunRequest::Reset)
                    && !matches!(
                        b.suite_status,
                        Some(SuiteStatus::Pending | SuiteStatus::InProgress)
                    );
                let ready = b.is_ready();
                if ready {
                    b.mark_queued();
                }
                (request, reopen, ready)
            })
            .await;

        match request {
            RunRequest::InFlight => {
                tracing::info!(sha, board = target, "Run already on the board, ignoring request");
                return Ok(());
            }
            RunRequest::AlreadyWaiting => {
                tracing::debug!(sha, board = target, "Run already waiting");
            }
            RunRequest::Inserted | RunRequest::Reset => {
                tracing::info!(sha, board = target, ?request, "Run requested");
            }
        }

        self.ensure_check_suite(sha).await;
        if reopen {
            self.report_suite(sha, SuiteStatus::Pending, "Waiting for the board")
                .await;
        }
        if matches!(request, RunRequest::Inserted | RunRequest::Reset) {
            self.report_run(sha, target, RunStatus::Pending, "Waiting for the board")
                .await;
        }
        if ready {
            self.enqueue(sha)?;
        }
        Ok(())
    }

    async fn artifact_ready(&self, sha: &str, url: &str) -> Result<(), CoordinatorError> {
        let (ready, duplicate) = self
            .index
            .get_or_create(sha, |b| {
                let duplicate = b.binary_url.as_deref() == Some(url);
                b.binary_url = Some(url.to_string());
                b.touch();
                let ready = b.is_ready();
                if ready {
                    b.mark_queued();
                }
                (ready, duplicate)
            })
            .await;

        self.ensure_check_suite(sha).await;

        if ready {
            tracing::info!(sha, url, "Toolchain ready, build queued");
            self.enqueue(sha)?;
        } else if duplicate {
            tracing::info!(sha, "Duplicate artifact notification ignored");
        } else {
            tracing::info!(sha, url, "Toolchain ready, no runs waiting");
        }
        Ok(())
    }

    fn enqueue(&self, sha: &str) -> Result<(), CoordinatorError> {
        // Count before sending: the worker may receive before send returns.
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.queue.send(sha.to_string()).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(CoordinatorError::QueueClosed);
        }
        crate::metrics::queue_depth(depth);
        Ok(())
    }

    // ── Reporting ──

    /// Create the commit's check-suite unless it exists or is being created.
    async fn ensure_check_suite(&self, sha: &str) {
        let claimed = self
            .index
            .update(sha, |b| {
                if b.check_suite.is_some() || b.suite_creating {
                    return false;
                }
                b.suite_creating = true;
                true
            })
            .await
            .unwrap_or(false);
        if !claimed {
            return;
        }

        let suite = match self.reported(self.reporter.create_check_suite(sha)).await {
            Ok(suite) => Some(suite),
            Err(e) => {
                log_report_error(sha, "create check-suite", &e);
                None
            }
        };
        self.index
            .update(sha, |b| {
                b.suite_creating = false;
                if suite.is_some() {
                    b.check_suite = suite;
                }
            })
            .await;
    }

    async fn report_suite(&self, sha: &str, status: SuiteStatus, detail: &str) {
        self.index
            .update(sha, |b| b.suite_status = Some(status))
            .await;
        if let Err(e) = self
            .reported(self.reporter.set_check_suite_status(sha, status, detail))
            .await
        {
            log_report_error(sha, "update check-suite", &e);
        }
    }

    async fn report_run(&self, sha: &str, target: &str, status: RunStatus, detail: &str) {
        let _guard = self.run_reports.lock().await;

        let Some((current, existing)) = self
            .index
            .update(sha, |b| b.runs.get(target).map(|r| (r.status, r.check_run)))
            .await
            .flatten()
        else {
            return;
        };
        if status == RunStatus::Pending && !current.is_runnable() {
            tracing::debug!(sha, board = target, "Run already left Pending, skipping stale report");
            return;
        }

        match self
            .reported(
                self.reporter
                    .create_or_update_check_run(sha, target, existing, status, detail),
            )
            .await
        {
            Ok(run_ref) => {
                self.index
                    .update(sha, |b| {
                        if let Some(run) = b.runs.get_mut(target) {
                            run.check_run = Some(run_ref);
                        }
                    })
                    .await;
            }
            Err(e) => log_report_error(sha, "update check-run", &e),
        }
    }

    /// Bound a reporter call so a stalled provider cannot hold up the caller.
    async fn reported<T>(
        &self,
        fut: impl Future<Output = Result<T, ReportError>>,
    ) -> Result<T, ReportError> {
        let limit = self.timing.report_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(ReportError::Timeout(limit)))
    }

    // ── Worker ──

    /// Drain the queue forever. Spawned once as a background tokio task.
    pub async fn run_worker(self: Arc<Self>, mut queue: BuildQueue) {
        tracing::info!(boards = self.registry.len(), "Build worker started");

        while let Some(sha) = queue.recv().await {
            let depth = self
                .depth
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)))
                .unwrap_or_default()
                .saturating_sub(1);
            crate::metrics::queue_depth(depth);

            // Driver panics end the build, not the worker.
            let this = self.clone();
            let job_sha = sha.clone();
            if let Err(e) = tokio::spawn(async move { this.process_build(&job_sha).await }).await {
                tracing::error!(sha = %sha, "Build processing panicked: {e}");
                self.recover_abandoned(&sha).await;
            }
        }

        tracing::info!("Build queue closed, worker exiting");
    }

    /// Fail the runs a panicked pass left on the board and tell GitHub.
    ///
    /// Waiting runs go round again only when the pass got as far as the
    /// board; a panic before that (toolchain install) would just repeat.
    async fn recover_abandoned(&self, sha: &str) {
        let Some((abandoned, requeue)) = self
            .index
            .update(sha, |b| {
                let abandoned = abandon_build(b);
                let ready = !abandoned.is_empty() && b.is_ready();
                if ready {
                    b.mark_queued();
                } else {
                    b.unqueue_runs();
                }
                (abandoned, ready)
            })
            .await
        else {
            return;
        };

        for target in &abandoned {
            crate::metrics::run_status_changed(target, RunStatus::Failed.as_str());
            self.report_run(sha, target, RunStatus::Failed, ABANDONED_DETAIL)
                .await;
        }
        self.report_suite(sha, SuiteStatus::Failed, "Worker panicked while testing this commit")
            .await;
        crate::metrics::build_finished("error");

        if requeue {
            tracing::info!(sha, "Requeueing runs left waiting by the panicked pass");
            if let Err(e) = self.enqueue(sha) {
                tracing::error!(sha, "Failed to requeue build: {e}");
            }
        }
    }

    /// Install the toolchain once, then put every waiting target on the board.
    pub async fn process_build(&self, sha: &str) {
        let claim = self
            .index
            .update(sha, |b| {
                b.queued = false;
                match (&b.binary_url, b.has_runnable_runs()) {
                    (Some(url), true) => {
                        b.processing = true;
                        b.finished_at = None;
                        Some(url.clone())
                    }
                    _ => None,
                }
            })
            .await;

        let url = match claim {
            None => {
                tracing::warn!(sha, "Queued build is no longer indexed");
                return;
            }
            Some(None) => {
                tracing::debug!(sha, "Nothing left to run");
                return;
            }
            Some(Some(url)) => url,
        };

        tracing::info!(sha, url = %url, "Starting tests for commit");
        self.report_suite(sha, SuiteStatus::InProgress, "Installing toolchain")
            .await;

        let start = Instant::now();
        let install = self.builder.build(sha, &url).await;
        crate::metrics::artifact_build_duration(start.elapsed().as_millis() as u64);

        if !install.success {
            tracing::error!(sha, "Toolchain install failed, skipping all runs");
            self.index
                .update(sha, |b| {
                    b.unqueue_runs();
                    b.processing = false;
                })
                .await;
            self.report_suite(sha, SuiteStatus::Failed, &install.output)
                .await;
            crate::metrics::build_finished("error");
            return;
        }

        let (passed, summary) = loop {
            match self.index.update(sha, next_step).await {
                Some(Next::Target(target)) => self.run_target(sha, &target).await,
                Some(Next::Done { passed, summary }) => break (passed, summary),
                None => return,
            }
        };

        let status = if passed {
            SuiteStatus::Passed
        } else {
            SuiteStatus::Failed
        };
        tracing::info!(sha, status = status.as_str(), "Build finished");
        self.report_suite(sha, status, &summary).await;
        crate::metrics::build_finished(status.as_str());

        // Runs requested while this pass held the build go round again.
        let requeue = self
            .index
            .update(sha, |b| {
                b.processing = false;
                let ready = b.is_ready();
                if ready {
                    b.mark_queued();
                }
                ready
            })
            .await
            .unwrap_or(false);
        if requeue {
            if let Err(e) = self.enqueue(sha) {
                tracing::error!(sha, "Failed to requeue build: {e}");
            }
        }
    }

    /// Flash, settle, and test one target. Every failure is terminal for the run.
    async fn run_target(&self, sha: &str, target: &str) {
        let board = match self.registry.resolve(target) {
            Ok(board) => board.clone(),
            Err(e) => {
                tracing::error!(sha, board = target, "{e}; dropping run");
                self.index
                    .update(sha, |b| {
                        b.runs.remove(target);
                    })
                    .await;
                return;
            }
        };

        if !self.transition(sha, target, RunStatus::Flashing, None).await {
            return;
        }
        self.report_run(
            sha,
            target,
            RunStatus::Flashing,
            &format!("Flashing {} on {}", board.display_name, board.device),
        )
        .await;

        let flash = self
            .bounded(
                "flash",
                &board,
                self.timing.flash_timeout,
                self.driver.flash(&board, sha),
            )
            .await;
        if !flash.success {
            tracing::warn!(sha, board = target, "Flash failed");
            self.finish_run(sha, target, RunStatus::Failed, flash.output)
                .await;
            return;
        }

        tokio::time::sleep(self.timing.settle).await;

        if !self.transition(sha, target, RunStatus::Testing, None).await {
            return;
        }
        self.report_run(sha, target, RunStatus::Testing, "Reading test output")
            .await;

        let test = self
            .bounded(
                "test",
                &board,
                self.timing.test_timeout,
                self.driver.test(&board),
            )
            .await;
        let status = if test.success {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        self.finish_run(sha, target, status, test.output).await;
    }

    async fn finish_run(&self, sha: &str, target: &str, status: RunStatus, output: String) {
        if self
            .transition(sha, target, status, Some(output.clone()))
            .await
        {
            tracing::info!(sha, board = target, status = status.as_str(), "Run finished");
            self.report_run(sha, target, status, &output).await;
        }
    }

    async fn transition(
        &self,
        sha: &str,
        target: &str,
        next: RunStatus,
        detail: Option<String>,
    ) -> bool {
        let result = self
            .index
            .update(sha, |b| {
                b.touch();
                let run = b.runs.get_mut(target)?;
                Some(run.advance(next).map(|()| {
                    if detail.is_some() {
                        run.detail = detail;
                    }
                }))
            })
            .await
            .flatten();

        match result {
            Some(Ok(())) => {
                crate::metrics::run_status_changed(target, next.as_str());
                tracing::debug!(sha, board = target, status = next.as_str(), "Run status changed");
                true
            }
            Some(Err(e)) => {
                tracing::error!(sha, "{e}");
                false
            }
            None => {
                tracing::warn!(sha, board = target, "Run vanished from build");
                false
            }
        }
    }

    /// Run a board step under a deadline; expiry is a failed step.
    async fn bounded(
        &self,
        step: &'static str,
        board: &Board,
        limit: Duration,
        fut: impl Future<Output = StepOutput>,
    ) -> StepOutput {
        let start = Instant::now();
        let out = match tokio::time::timeout(limit, fut).await {
            Ok(out) => out,
            Err(_) => {
                tracing::warn!(board = %board.target, step, "Board step timed out");
                StepOutput::failure(format!(
                    "{step} timeout: no result from {} after {:?}",
                    board.device, limit
                ))
            }
        };
        crate::metrics::board_step_duration(step, &board.target, start.elapsed().as_millis() as u64);
        out
    }

    // ── Retention ──

    /// Periodically drop finished builds older than `retention`.
    pub fn spawn_eviction(self: Arc<Self>, retention: chrono::Duration, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
                    tracing::warn!(?retention, "Retention window out of range, skipping sweep");
                    continue;
                };
                let evicted = self.index.evict_finished(cutoff).await;
                if evicted > 0 {
                    tracing::info!(evicted, "Evicted finished builds");
                }
            }
        })
    }
}

fn next_step(b: &mut Build) -> Next {
    if let Some(target) = b.next_runnable() {
        return Next::Target(target.to_string());
    }

    b.finished_at = Some(Utc::now());
    let passed_count = b
        .runs
        .values()
        .filter(|r| r.status == RunStatus::Passed)
        .count();
    let mut summary = format!("{passed_count}/{} targets passed", b.runs.len());
    for run in b.runs.values() {
        summary.push_str(&format!("\n{}: {}", run.target, run.status));
    }
    Next::Done {
        passed: b.all_passed(),
        summary,
    }
}

const ABANDONED_DETAIL: &str = "worker panicked while the board was in use";

/// Fail in-flight runs and release the build. Returns the failed targets.
fn abandon_build(b: &mut Build) -> Vec<String> {
    let mut abandoned = Vec::new();
    for run in b.runs.values_mut().filter(|r| r.status.is_in_flight()) {
        if run.advance(RunStatus::Failed).is_ok() {
            run.detail = Some(ABANDONED_DETAIL.to_string());
            abandoned.push(run.target.clone());
        }
    }
    b.processing = false;
    b.queued = false;
    b.finished_at = Some(Utc::now());
    abandoned
}

fn log_report_error(sha: &str, action: &str, e: &ReportError) {
    match e {
        ReportError::Disabled => tracing::debug!(sha, "Skipping {action}: {e}"),
        _ => tracing::warn!(sha, "Failed to {action}: {e}"),
    }
}
