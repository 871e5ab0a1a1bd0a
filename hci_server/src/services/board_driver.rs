//! Board driver: flashes test firmware and captures its serial test report.
//!
//! The firmware prints one line per assertion, `PASS <name>` or
//! `FAIL <name>`; anything else on the port is carried through as detail.

use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::{truncate_output, StepOutput};
use crate::models::board::Board;

/// Output kept per step.
const MAX_OUTPUT: usize = 65_536;

static RESULT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(pass|fail)(?:ed)?\b[\s:-]*(.*)$").unwrap());

#[async_trait]
pub trait BoardDriver: Send + Sync {
    async fn flash(&self, board: &Board, sha: &str) -> StepOutput;
    async fn test(&self, board: &Board) -> StepOutput;
}

/// Tally of the structured result lines in a test capture.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

impl TestReport {
    pub fn parse(output: &str) -> Self {
        let mut report = TestReport::default();
        for line in output.lines() {
            let Some(caps) = RESULT_LINE.captures(line) else {
                continue;
            };
            let name = caps[2].trim().to_string();
            if caps[1].eq_ignore_ascii_case("pass") {
                report.passed.push(name);
            } else {
                report.failed.push(name);
            }
        }
        report
    }

    /// At least one assertion ran and none failed.
    pub fn is_success(&self) -> bool {
        !self.passed.is_empty() && self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!("{} passed, {} failed", self.passed.len(), self.failed.len())
    }
}

/// Drives boards through the shell commands in their descriptors.
#[derive(Debug, Clone, Default)]
pub struct ShellBoardDriver {
    work_dir: Option<String>,
}

impl ShellBoardDriver {
    pub fn new(work_dir: Option<String>) -> Self {
        Self { work_dir }
    }

    async fn run(&self, board: &Board, command: &str, sha: Option<&str>) -> (bool, String) {
        let mut cmd = Command::new("bash");
        cmd.args(["-c", command])
            .env("HCI_TARGET", &board.target)
            .env("HCI_DEVICE", &board.device)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(sha) = sha {
            cmd.env("HCI_SHA", sha);
        }
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        match cmd.output().await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                (output.status.success(), truncate_output(&text, MAX_OUTPUT))
            }
            Err(e) => (false, format!("Failed to execute command: {e}")),
        }
    }
}

#[async_trait]
impl BoardDriver for ShellBoardDriver {
    async fn flash(&self, board: &Board, sha: &str) -> StepOutput {
        tracing::info!(board = %board.target, command = %board.flash_command, "Flashing board");
        let (ok, output) = self.run(board, &board.flash_command, Some(sha)).await;
        StepOutput { success: ok, output }
    }

    async fn test(&self, board: &Board) -> StepOutput {
        tracing::info!(board = %board.target, command = %board.test_command, "Reading test output");
        let (ok, output) = self.run(board, &board.test_command, None).await;
        let report = TestReport::parse(&output);
        tracing::info!(board = %board.target, exit_ok = ok, "{}", report.summary());

        StepOutput {
            success: ok && report.is_success(),
            output: format!("{}\n\n{output}", report.summary()),
        }
    }
}
