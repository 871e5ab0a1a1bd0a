//! Toolchain artifacts: locating the built tarball and installing it.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::StepOutput;

/// Produces a runnable toolchain for a commit. A failure aborts the whole build.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, sha: &str, binary_url: &str) -> StepOutput;
}

/// Downloads the toolchain tarball and extracts it into the install prefix.
pub struct ToolchainInstaller {
    client: reqwest::Client,
    work_dir: PathBuf,
    install_prefix: PathBuf,
    timeout: Duration,
}

impl ToolchainInstaller {
    pub fn new(work_dir: &str, install_prefix: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            work_dir: PathBuf::from(work_dir),
            install_prefix: PathBuf::from(install_prefix),
            timeout,
        }
    }

    async fn install(&self, sha: &str, binary_url: &str, log: &mut Vec<String>) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let tarball = self.work_dir.join(format!("toolchain-{sha}.tar.gz"));

        log.push(format!("Downloading toolchain from {binary_url}"));
        let resp = self.client.get(binary_url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("bad status: {}", resp.status());
        }
        let mut file = tokio::fs::File::create(&tarball).await?;
        let mut body = resp.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;
        log.push(format!("Downloaded {written} bytes"));

        log.push(format!(
            "Installing toolchain into {}",
            self.install_prefix.display()
        ));
        let output = Command::new("tar")
            .arg("-xzf")
            .arg(&tarball)
            .arg("-C")
            .arg(&self.install_prefix)
            .kill_on_drop(true)
            .output()
            .await?;
        let _ = tokio::fs::remove_file(&tarball).await;

        if !output.status.success() {
            anyhow::bail!(
                "tar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactBuilder for ToolchainInstaller {
    async fn build(&self, sha: &str, binary_url: &str) -> StepOutput {
        let mut log = Vec::new();
        let result = tokio::time::timeout(self.timeout, self.install(sha, binary_url, &mut log)).await;

        match result {
            Ok(Ok(())) => {
                log.push("Toolchain installed".to_string());
                StepOutput::success(log.join("\n"))
            }
            Ok(Err(e)) => {
                log.push(format!("Toolchain install failed: {e:#}"));
                StepOutput::failure(log.join("\n"))
            }
            Err(_) => {
                log.push(format!("Toolchain install timed out after {:?}", self.timeout));
                StepOutput::failure(log.join("\n"))
            }
        }
    }
}

/// One entry of the CI provider's artifact listing.
#[derive(Debug, Deserialize)]
pub struct CiArtifact {
    #[serde(default)]
    pub path: String,
    pub url: String,
}

/// Pick the toolchain tarball out of a build's artifact listing.
pub fn select_tarball(artifacts: &[CiArtifact]) -> Option<String> {
    artifacts
        .iter()
        .find(|a| a.path.ends_with(".tar.gz") || a.url.ends_with(".tar.gz"))
        .map(|a| a.url.clone())
}

/// Query the CI provider for the tarball produced by build `build_num`.
pub async fn resolve_artifact_url(api_url: &str, build_num: u64) -> anyhow::Result<String> {
    let url = api_url.replace("{build_num}", &build_num.to_string());
    let artifacts: Vec<CiArtifact> = reqwest::Client::new()
        .get(&url)
        .header("Accept", "application/json")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    select_tarball(&artifacts)
        .ok_or_else(|| anyhow::anyhow!("build {build_num} has no toolchain tarball"))
}
