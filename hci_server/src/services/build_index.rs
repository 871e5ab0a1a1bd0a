//! Build index: the commit → Build map shared by every event path.
//!
//! Every read-modify-write runs inside one lock acquisition. Callers pass a
//! closure instead of holding a guard, so the lock is never held across an
//! await on GitHub, the toolchain download, or the board.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::build::Build;

#[derive(Debug, Default)]
pub struct BuildIndex {
    builds: Mutex<HashMap<String, Build>>,
}

impl BuildIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locate the build for `sha`, creating it if unseen, and mutate it.
    pub async fn get_or_create<R>(&self, sha: &str, f: impl FnOnce(&mut Build) -> R) -> R {
        let mut builds = self.builds.lock().await;
        let build = builds.entry(sha.to_string()).or_insert_with(|| {
            tracing::info!(sha, "Build created");
            Build::new(sha)
        });
        let out = f(build);
        crate::metrics::indexed_builds(builds.len());
        out
    }

    /// Mutate an existing build. `None` when the sha is unknown.
    pub async fn update<R>(&self, sha: &str, f: impl FnOnce(&mut Build) -> R) -> Option<R> {
        let mut builds = self.builds.lock().await;
        builds.get_mut(sha).map(f)
    }

    /// Snapshot of one build.
    pub async fn get(&self, sha: &str) -> Option<Build> {
        self.builds.lock().await.get(sha).cloned()
    }

    /// Snapshot of every build, newest first.
    pub async fn list(&self) -> Vec<Build> {
        let builds = self.builds.lock().await;
        let mut out: Vec<Build> = builds.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub async fn len(&self) -> usize {
        self.builds.lock().await.len()
    }

    /// Drop idle builds whose runs all finished before `cutoff`.
    pub async fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut builds = self.builds.lock().await;
        let before = builds.len();
        builds.retain(|_, b| {
            let expired = b.is_idle()
                && b.all_terminal()
                && b.finished_at.is_some_and(|finished| finished < cutoff);
            !expired
        });
        crate::metrics::indexed_builds(builds.len());
        before - builds.len()
    }
}
