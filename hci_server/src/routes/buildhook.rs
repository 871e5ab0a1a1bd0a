//! CI buildhook: the toolchain for a commit finished building upstream.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use crate::config::HciConfig;
use crate::events::build::BuildEvent;
use crate::services::artifact_service;
use crate::services::coordinator::Coordinator;
use crate::services::github_service;

/// Build notification from the upstream CI provider.
#[derive(Debug, Deserialize)]
pub struct BuildhookPayload {
    pub vcs_revision: String,
    #[serde(default)]
    pub build_num: Option<u64>,
    #[serde(default)]
    pub binary_url: Option<String>,
}

impl BuildhookPayload {
    /// Accept the bare form or CircleCI's `{ "payload": { ... } }` envelope.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        match value.get("payload") {
            Some(inner) if inner.is_object() => serde_json::from_value(inner.clone()),
            _ => serde_json::from_value(value),
        }
    }
}

pub async fn handle_buildhook(
    config: &HciConfig,
    coordinator: &Coordinator,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    // The payload names a tarball that gets unpacked into the install prefix.
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !github_service::validate_signature(&config.buildhook_secret, &body, signature) {
        tracing::warn!("Buildhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let info = BuildhookPayload::parse(&body).map_err(|e| {
        tracing::warn!("Invalid buildhook payload: {e}");
        StatusCode::BAD_REQUEST
    })?;
    if info.vcs_revision.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    tracing::info!(
        sha = %info.vcs_revision,
        build_num = ?info.build_num,
        "Got the buildhook"
    );

    let url = resolve_url(config, &info).await?;
    tracing::info!(sha = %info.vcs_revision, url = %url, "Toolchain download located");

    coordinator
        .handle(BuildEvent::ArtifactReady {
            sha: info.vcs_revision,
            url,
        })
        .await
        .map(|()| StatusCode::ACCEPTED)
        .map_err(|e| {
            tracing::error!("Failed to reduce buildhook: {e}");
            super::coordinator_status(&e)
        })
}

/// Explicit URL, then the CI provider's artifact listing, then the default.
async fn resolve_url(config: &HciConfig, info: &BuildhookPayload) -> Result<String, StatusCode> {
    if let Some(url) = info.binary_url.as_deref().filter(|u| !u.is_empty()) {
        return Ok(url.to_string());
    }

    if let Some(build_num) = info.build_num {
        return artifact_service::resolve_artifact_url(&config.artifact_api_url, build_num)
            .await
            .map_err(|e| {
                tracing::error!(build_num, "Failed to locate toolchain artifact: {e}");
                StatusCode::BAD_GATEWAY
            });
    }

    config.default_artifact_url.clone().ok_or_else(|| {
        tracing::warn!(sha = %info.vcs_revision, "Buildhook has no artifact to install");
        StatusCode::BAD_REQUEST
    })
}
