//! TinyHCI configuration: loaded from environment variables at startup.

use std::time::Duration;

const DEFAULT_RETENTION_HOURS: i64 = 168;
const MAX_RETENTION_HOURS: i64 = 24 * 365 * 100;

#[derive(Clone, Debug)]
pub struct HciConfig {
    /// GitHub repository checks are reported against (`owner/name`).
    pub github_repo: String,
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// HMAC secret the upstream CI signs buildhooks with.
    pub buildhook_secret: String,
    /// Preissued token for the checks API; overrides the App credentials.
    pub github_token: String,
    /// GitHub App the checks are reported as.
    pub github_app_id: Option<u64>,
    pub github_installation_id: Option<u64>,
    /// PEM private key of the GitHub App.
    pub github_key_file: Option<String>,
    /// GitHub REST API base URL.
    pub github_api_url: String,
    /// Toolchain artifact used when a buildhook carries neither URL nor build number.
    pub default_artifact_url: Option<String>,
    /// CI provider artifacts endpoint; `{build_num}` is substituted.
    pub artifact_api_url: String,
    /// Scratch directory for downloaded toolchains.
    pub work_dir: String,
    /// Directory the toolchain tarball is extracted into.
    pub install_prefix: String,
    /// Delay after flashing before the test output is read.
    pub settle_secs: u64,
    /// Upper bound on a single flash.
    pub flash_timeout_secs: u64,
    /// Upper bound on a single test capture.
    pub test_timeout_secs: u64,
    /// Upper bound on downloading and installing a toolchain.
    pub build_timeout_secs: u64,
    /// Upper bound on one GitHub checks API call.
    pub report_timeout_secs: u64,
    /// Hours a finished build stays in the index.
    pub retention_hours: i64,
    /// Seconds between eviction sweeps.
    pub evict_interval_secs: u64,
}

impl HciConfig {
    pub fn from_env() -> Self {
        let github_repo =
            std::env::var("HCI_GITHUB_REPO").unwrap_or_else(|_| "tinygo-org/tinygo".to_string());
        let github_webhook_secret = std::env::var("HCI_WEBHOOK_SECRET").unwrap_or_default();
        let github_token = std::env::var("HCI_GITHUB_TOKEN").unwrap_or_default();
        let github_app_id = std::env::var("HCI_GITHUB_APP_ID")
            .ok()
            .and_then(|s| s.parse().ok());
        let github_installation_id = std::env::var("HCI_GITHUB_INSTALLATION_ID")
            .ok()
            .and_then(|s| s.parse().ok());
        let github_key_file = std::env::var("HCI_GITHUB_KEY_FILE")
            .ok()
            .filter(|s| !s.is_empty());
        let buildhook_secret = std::env::var("HCI_BUILDHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| github_webhook_secret.clone());
        let github_api_url = std::env::var("HCI_GITHUB_API_URL")
            .unwrap_or_else(|_| "https://api.github.com".to_string());
        let default_artifact_url = std::env::var("HCI_DEFAULT_ARTIFACT_URL")
            .ok()
            .filter(|s| !s.is_empty());
        let artifact_api_url = std::env::var("HCI_ARTIFACT_API_URL").unwrap_or_else(|_| {
            "https://circleci.com/api/v1.1/project/github/tinygo-org/tinygo/{build_num}/artifacts"
                .to_string()
        });
        let work_dir = std::env::var("HCI_WORK_DIR").unwrap_or_else(|_| "/tmp/tinyhci".to_string());
        let install_prefix =
            std::env::var("HCI_INSTALL_PREFIX").unwrap_or_else(|_| "/usr/local".to_string());

        if github_webhook_secret.is_empty() {
            tracing::warn!("HCI_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if buildhook_secret.is_empty() {
            tracing::warn!("HCI_BUILDHOOK_SECRET not set -- buildhook accepts unsigned artifact URLs");
        }
        if github_token.is_empty() && github_app_id.is_none() {
            tracing::warn!(
                "Neither HCI_GITHUB_TOKEN nor HCI_GITHUB_APP_ID set -- GitHub check reporting disabled"
            );
        }

        Self {
            github_repo,
            github_webhook_secret,
            buildhook_secret,
            github_token,
            github_app_id,
            github_installation_id,
            github_key_file,
            github_api_url,
            default_artifact_url,
            artifact_api_url,
            work_dir,
            install_prefix,
            settle_secs: env_or("HCI_SETTLE_SECS", 2),
            flash_timeout_secs: env_or("HCI_FLASH_TIMEOUT", 120),
            test_timeout_secs: env_or("HCI_TEST_TIMEOUT", 300),
            build_timeout_secs: env_or("HCI_BUILD_TIMEOUT", 600),
            report_timeout_secs: env_or("HCI_REPORT_TIMEOUT", 30),
            retention_hours: env_or("HCI_RETENTION_HOURS", DEFAULT_RETENTION_HOURS),
            evict_interval_secs: env_or("HCI_EVICT_INTERVAL", 3600),
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs.max(1))
    }

    /// Retention window, capped at a century. Negative hours fall back to the default.
    pub fn retention(&self) -> chrono::Duration {
        let hours = if self.retention_hours < 0 {
            tracing::warn!(
                hours = self.retention_hours,
                "Negative HCI_RETENTION_HOURS, using {DEFAULT_RETENTION_HOURS}"
            );
            DEFAULT_RETENTION_HOURS
        } else {
            self.retention_hours.min(MAX_RETENTION_HOURS)
        };
        chrono::Duration::try_hours(hours).unwrap_or_else(|| chrono::Duration::days(365))
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval_secs.max(1))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::test_config;

    #[test]
    fn retention_is_clamped() {
        let huge = HciConfig {
            retention_hours: i64::MAX,
            ..test_config()
        };
        assert_eq!(huge.retention(), chrono::Duration::hours(MAX_RETENTION_HOURS));
        assert!(chrono::Utc::now().checked_sub_signed(huge.retention()).is_some());

        let negative = HciConfig {
            retention_hours: -5,
            ..test_config()
        };
        assert_eq!(negative.retention(), chrono::Duration::hours(168));
    }

    #[test]
    fn report_timeout_is_never_zero() {
        let config = HciConfig {
            report_timeout_secs: 0,
            ..test_config()
        };
        assert_eq!(config.report_timeout(), Duration::from_secs(1));
    }
}
