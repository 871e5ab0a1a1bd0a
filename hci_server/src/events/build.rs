//! Build event definitions.

use serde::{Deserialize, Serialize};

/// Events that move a commit's build forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildEvent {
    /// A new commit is known (push or check-suite request).
    CommitDiscovered { sha: String },
    /// A specific target must be (re)tested.
    RunRequested { sha: String, target: String },
    /// The toolchain artifact for the commit has been built.
    ArtifactReady { sha: String, url: String },
}

impl BuildEvent {
    pub fn sha(&self) -> &str {
        match self {
            BuildEvent::CommitDiscovered { sha }
            | BuildEvent::RunRequested { sha, .. }
            | BuildEvent::ArtifactReady { sha, .. } => sha,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BuildEvent::CommitDiscovered { .. } => "commit_discovered",
            BuildEvent::RunRequested { .. } => "run_requested",
            BuildEvent::ArtifactReady { .. } => "artifact_ready",
        }
    }
}
