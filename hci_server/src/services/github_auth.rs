//! GitHub App authentication: app JWTs exchanged for installation tokens.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::github_service::{ReportError, USER_AGENT};
use crate::config::HciConfig;

/// Renew installation tokens this long before GitHub expires them.
const REFRESH_MARGIN_SECS: i64 = 300;
/// GitHub rejects app JWTs that live longer than ten minutes.
const APP_JWT_SECS: i64 = 540;

#[derive(Debug, Serialize, Deserialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Clone, Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Credentials the checks API is called with.
pub enum GithubAuth {
    /// No credentials; reporting is a logged no-op.
    Disabled,
    /// Preissued token, used as-is.
    Token(String),
    /// GitHub App installation, tokens minted on demand.
    App(GithubApp),
}

impl GithubAuth {
    /// A static `HCI_GITHUB_TOKEN` wins over App credentials.
    pub fn from_config(config: &HciConfig) -> anyhow::Result<Self> {
        if !config.github_token.is_empty() {
            return Ok(GithubAuth::Token(config.github_token.clone()));
        }

        match (
            config.github_app_id,
            config.github_installation_id,
            config.github_key_file.as_deref(),
        ) {
            (Some(app_id), Some(installation_id), Some(key_file)) => {
                tracing::info!(app_id, installation_id, "Authenticating as GitHub App");
                let app = GithubApp::from_key_file(app_id, installation_id, Path::new(key_file))?;
                Ok(GithubAuth::App(app))
            }
            (None, None, None) => Ok(GithubAuth::Disabled),
            _ => anyhow::bail!(
                "HCI_GITHUB_APP_ID, HCI_GITHUB_INSTALLATION_ID and HCI_GITHUB_KEY_FILE must be set together"
            ),
        }
    }

    /// Bearer token for the next API call.
    pub async fn token(
        &self,
        client: &reqwest::Client,
        api_url: &str,
    ) -> Result<String, ReportError> {
        match self {
            GithubAuth::Disabled => Err(ReportError::Disabled),
            GithubAuth::Token(token) => Ok(token.clone()),
            GithubAuth::App(app) => app.installation_token(client, api_url).await,
        }
    }
}

/// A GitHub App installation and its cached access token.
pub struct GithubApp {
    app_id: u64,
    installation_id: u64,
    key: EncodingKey,
    cached: Mutex<Option<InstallationToken>>,
}

impl GithubApp {
    /// `pem` is the App's RSA private key.
    pub fn new(app_id: u64, installation_id: u64, pem: &[u8]) -> Result<Self, ReportError> {
        Ok(Self {
            app_id,
            installation_id,
            key: EncodingKey::from_rsa_pem(pem)?,
            cached: Mutex::new(None),
        })
    }

    pub fn from_key_file(app_id: u64, installation_id: u64, path: &Path) -> anyhow::Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading GitHub App key {}", path.display()))?;
        Self::new(app_id, installation_id, &pem)
            .with_context(|| format!("loading GitHub App key {}", path.display()))
    }

    fn app_jwt(&self) -> Result<String, ReportError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // Backdated for clock drift between this host and GitHub.
            iat: now - 60,
            exp: now + APP_JWT_SECS,
            iss: self.app_id.to_string(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }

    /// The cached installation token, exchanged afresh once it nears expiry.
    pub async fn installation_token(
        &self,
        client: &reqwest::Client,
        api_url: &str,
    ) -> Result<String, ReportError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(token.token.clone());
            }
        }

        let url = format!(
            "{api_url}/app/installations/{}/access_tokens",
            self.installation_id
        );
        let resp = client
            .post(url)
            .bearer_auth(self.app_jwt()?)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReportError::Api { status, body });
        }

        let token: InstallationToken = resp.json().await?;
        tracing::info!(
            installation_id = self.installation_id,
            expires_at = %token.expires_at,
            "GitHub installation token refreshed"
        );
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use axum::http::{HeaderMap, StatusCode};
    use jsonwebtoken::{DecodingKey, Validation};

    use super::*;
    use crate::services::fakes::test_config;

    const APP_KEY: &[u8] = include_bytes!("../../testdata/github_app_key.pem");
    const APP_PUBLIC_KEY: &[u8] = include_bytes!("../../testdata/github_app_key.pub.pem");

    /// Serves the access-token exchange for installation 42, recording each
    /// Authorization header. Tokens are numbered `ghs_1`, `ghs_2`, ...
    async fn token_server(
        status: StatusCode,
        lifetime: chrono::Duration,
    ) -> (String, Arc<StdMutex<Vec<String>>>, tokio::task::JoinHandle<()>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorded = seen.clone();
        let app = axum::Router::new().route(
            "/app/installations/42/access_tokens",
            axum::routing::post(move |headers: HeaderMap| {
                let recorded = recorded.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let n = {
                        let mut recorded = recorded.lock().unwrap();
                        recorded.push(auth);
                        recorded.len()
                    };
                    (
                        status,
                        axum::Json(serde_json::json!({
                            "token": format!("ghs_{n}"),
                            "expires_at": (Utc::now() + lifetime).to_rfc3339(),
                        })),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), seen, server)
    }

    #[tokio::test]
    async fn installation_token_is_cached() {
        let (api_url, seen, server) =
            token_server(StatusCode::CREATED, chrono::Duration::hours(1)).await;
        let app = GithubApp::new(7, 42, APP_KEY).unwrap();
        let client = reqwest::Client::new();

        assert_eq!(app.installation_token(&client, &api_url).await.unwrap(), "ghs_1");
        assert_eq!(app.installation_token(&client, &api_url).await.unwrap(), "ghs_1");
        server.abort();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        let jwt = seen[0].strip_prefix("Bearer ").unwrap();
        let claims = jsonwebtoken::decode::<AppClaims>(
            jwt,
            &DecodingKey::from_rsa_pem(APP_PUBLIC_KEY).unwrap(),
            &Validation::new(Algorithm::RS256),
        )
        .unwrap()
        .claims;
        assert_eq!(claims.iss, "7");
        assert!(claims.exp - claims.iat <= 600);
    }

    #[tokio::test]
    async fn token_near_expiry_is_refreshed() {
        let (api_url, seen, server) =
            token_server(StatusCode::CREATED, chrono::Duration::minutes(1)).await;
        let app = GithubApp::new(7, 42, APP_KEY).unwrap();
        let client = reqwest::Client::new();

        assert_eq!(app.installation_token(&client, &api_url).await.unwrap(), "ghs_1");
        assert_eq!(app.installation_token(&client, &api_url).await.unwrap(), "ghs_2");
        server.abort();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_exchange_is_api_error() {
        let (api_url, _seen, server) =
            token_server(StatusCode::UNAUTHORIZED, chrono::Duration::hours(1)).await;
        let app = GithubApp::new(7, 42, APP_KEY).unwrap();

        let err = app
            .installation_token(&reqwest::Client::new(), &api_url)
            .await
            .unwrap_err();
        server.abort();
        assert!(
            matches!(err, ReportError::Api { status, .. } if status == reqwest::StatusCode::UNAUTHORIZED),
            "{err}"
        );
    }

    #[test]
    fn invalid_key_is_rejected() {
        assert!(matches!(
            GithubApp::new(7, 42, b"not a key"),
            Err(ReportError::Jwt(_))
        ));
    }

    #[test]
    fn static_token_overrides_app_credentials() {
        let config = HciConfig {
            github_token: "ghp_static".to_string(),
            github_app_id: Some(7),
            github_installation_id: Some(42),
            github_key_file: Some("/nonexistent/key.pem".to_string()),
            ..test_config()
        };
        assert!(matches!(
            GithubAuth::from_config(&config).unwrap(),
            GithubAuth::Token(t) if t == "ghp_static"
        ));
    }

    #[test]
    fn app_credentials_load_from_config() {
        let key_file = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/github_app_key.pem");
        let config = HciConfig {
            github_app_id: Some(7),
            github_installation_id: Some(42),
            github_key_file: Some(key_file.to_string()),
            ..test_config()
        };
        assert!(matches!(
            GithubAuth::from_config(&config).unwrap(),
            GithubAuth::App(_)
        ));

        assert!(matches!(
            GithubAuth::from_config(&test_config()).unwrap(),
            GithubAuth::Disabled
        ));

        let partial = HciConfig {
            github_app_id: Some(7),
            ..test_config()
        };
        assert!(GithubAuth::from_config(&partial).is_err());
    }
}
