//! hci.build: All CI activity for one commit, and the per-target runs inside it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle to the provider's check-suite for a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSuiteRef(pub u64);

/// Opaque handle to the provider's check-run for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunRef(pub u64);

/// Status of one target's test cycle.
///
/// Moves forward only: Pending → Queued → Flashing → Testing → Passed | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Flashing,
    Testing,
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Queued => "queued",
            RunStatus::Flashing => "flashing",
            RunStatus::Testing => "testing",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }

    /// Waiting for the worker to pick it up.
    pub fn is_runnable(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Queued)
    }

    /// Currently holding the board.
    pub fn is_in_flight(self) -> bool {
        matches!(self, RunStatus::Flashing | RunStatus::Testing)
    }

    /// Whether `next` is a legal forward step from `self`.
    ///
    /// Pending may go straight to Flashing when a run is requested while its
    /// build is already being processed.
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Queued)
                | (RunStatus::Pending, RunStatus::Flashing)
                | (RunStatus::Queued, RunStatus::Flashing)
                | (RunStatus::Flashing, RunStatus::Testing)
                | (RunStatus::Flashing, RunStatus::Failed)
                | (RunStatus::Testing, RunStatus::Passed)
                | (RunStatus::Testing, RunStatus::Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status reported on the commit's check-suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    Pending,
    InProgress,
    Passed,
    Failed,
}

impl SuiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SuiteStatus::Pending => "pending",
            SuiteStatus::InProgress => "in_progress",
            SuiteStatus::Passed => "passed",
            SuiteStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SuiteStatus::Passed | SuiteStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("run {target}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub target: String,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// One target's test cycle within a build.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub target: String,
    pub status: RunStatus,
    pub check_run: Option<CheckRunRef>,
    /// Output captured by the last flash or test step.
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            status: RunStatus::Pending,
            check_run: None,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    pub fn advance(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                target: self.target.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// What a run request did to the build's run set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    /// First request for this target.
    Inserted,
    /// A terminal run was reset to Pending with a fresh check-run.
    Reset,
    /// The run is already waiting for the worker.
    AlreadyWaiting,
    /// The run is on the board right now; the request is dropped.
    InFlight,
}

/// All CI activity for one commit.
#[derive(Debug, Clone, Serialize)]
pub struct Build {
    pub sha: String,
    pub binary_url: Option<String>,
    pub check_suite: Option<CheckSuiteRef>,
    /// A check-suite create call is in flight.
    #[serde(skip)]
    pub suite_creating: bool,
    pub suite_status: Option<SuiteStatus>,
    pub runs: BTreeMap<String, Run>,
    /// Sitting in the processing queue.
    pub queued: bool,
    /// Currently owned by the worker.
    pub processing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn new(sha: &str) -> Self {
        let now = Utc::now();
        Self {
            sha: sha.to_string(),
            binary_url: None,
            check_suite: None,
            suite_creating: false,
            suite_status: None,
            runs: BTreeMap::new(),
            queued: false,
            processing: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Insert a Pending run for `target`, or reset a terminal one.
    pub fn request_run(&mut self, target: &str) -> RunRequest {
        self.touch();
        match self.runs.get_mut(target) {
            None => {
                self.runs.insert(target.to_string(), Run::new(target));
                self.finished_at = None;
                RunRequest::Inserted
            }
            Some(run) if run.status.is_terminal() => {
                run.status = RunStatus::Pending;
                run.detail = None;
                run.check_run = None;
                run.updated_at = Utc::now();
                self.finished_at = None;
                RunRequest::Reset
            }
            Some(run) if run.status.is_in_flight() => RunRequest::InFlight,
            Some(_) => RunRequest::AlreadyWaiting,
        }
    }

    pub fn has_runnable_runs(&self) -> bool {
        self.runs.values().any(|r| r.status.is_runnable())
    }

    /// Binary known, at least one run waiting, and not already with the worker.
    pub fn is_ready(&self) -> bool {
        self.binary_url.is_some() && self.has_runnable_runs() && !self.queued && !self.processing
    }

    /// Move every Pending run to Queued and flag the build as enqueued.
    pub fn mark_queued(&mut self) {
        for run in self.runs.values_mut() {
            if run.status == RunStatus::Pending {
                run.status = RunStatus::Queued;
                run.updated_at = Utc::now();
            }
        }
        self.queued = true;
        self.touch();
    }

    /// Put Queued runs back to Pending after a build that never reached the board.
    pub fn unqueue_runs(&mut self) {
        for run in self.runs.values_mut() {
            if run.status == RunStatus::Queued {
                run.status = RunStatus::Pending;
                run.updated_at = Utc::now();
            }
        }
        self.touch();
    }

    /// Next target the worker should put on the board, in target-name order.
    pub fn next_runnable(&self) -> Option<&str> {
        self.runs
            .values()
            .find(|r| r.status.is_runnable())
            .map(|r| r.target.as_str())
    }

    pub fn all_terminal(&self) -> bool {
        self.runs.values().all(|r| r.status.is_terminal())
    }

    pub fn all_passed(&self) -> bool {
        self.runs.values().all(|r| r.status == RunStatus::Passed)
    }

    /// Neither queued nor being processed.
    pub fn is_idle(&self) -> bool {
        !self.queued && !self.processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_moves_forward_only() {
        let mut run = Run::new("itsybitsy-m4");
        run.advance(RunStatus::Queued).unwrap();
        run.advance(RunStatus::Flashing).unwrap();
        run.advance(RunStatus::Testing).unwrap();
        run.advance(RunStatus::Passed).unwrap();

        let err = run.advance(RunStatus::Testing).unwrap_err();
        assert_eq!(err.from, RunStatus::Passed);
        assert_eq!(err.to, RunStatus::Testing);
        assert_eq!(run.status, RunStatus::Passed);
    }

    #[test]
    fn flash_failure_skips_testing() {
        let mut run = Run::new("arduino-nano33");
        run.advance(RunStatus::Flashing).unwrap();
        run.advance(RunStatus::Failed).unwrap();
        assert!(run.status.is_terminal());
    }

    #[test]
    fn pending_cannot_jump_to_terminal() {
        let mut run = Run::new("itsybitsy-m4");
        assert!(run.advance(RunStatus::Passed).is_err());
        assert!(run.advance(RunStatus::Testing).is_err());
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[test]
    fn request_run_resets_terminal_runs() {
        let mut build = Build::new("abc123");
        assert_eq!(build.request_run("itsybitsy-m4"), RunRequest::Inserted);
        assert_eq!(build.request_run("itsybitsy-m4"), RunRequest::AlreadyWaiting);

        let run = build.runs.get_mut("itsybitsy-m4").unwrap();
        run.advance(RunStatus::Flashing).unwrap();
        assert_eq!(build.request_run("itsybitsy-m4"), RunRequest::InFlight);

        let run = build.runs.get_mut("itsybitsy-m4").unwrap();
        run.advance(RunStatus::Failed).unwrap();
        run.detail = Some("flash: no device".to_string());
        assert_eq!(build.request_run("itsybitsy-m4"), RunRequest::Reset);

        let run = &build.runs["itsybitsy-m4"];
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.detail.is_none());
        assert_eq!(build.runs.len(), 1);
    }

    #[test]
    fn readiness_needs_binary_and_waiting_run() {
        let mut build = Build::new("abc123");
        assert!(!build.is_ready());

        build.request_run("itsybitsy-m4");
        assert!(!build.is_ready());

        build.binary_url = Some("http://x/bin.tgz".to_string());
        assert!(build.is_ready());

        build.mark_queued();
        assert!(!build.is_ready());
        assert_eq!(build.runs["itsybitsy-m4"].status, RunStatus::Queued);

        build.unqueue_runs();
        assert_eq!(build.runs["itsybitsy-m4"].status, RunStatus::Pending);
    }

    #[test]
    fn next_runnable_follows_target_order() {
        let mut build = Build::new("abc123");
        build.request_run("itsybitsy-m4");
        build.request_run("arduino-nano33");
        assert_eq!(build.next_runnable(), Some("arduino-nano33"));

        build
            .runs
            .get_mut("arduino-nano33")
            .unwrap()
            .advance(RunStatus::Flashing)
            .unwrap();
        assert_eq!(build.next_runnable(), Some("itsybitsy-m4"));
    }
}
