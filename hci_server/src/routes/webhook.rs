//! GitHub webhook handler: turns push and check events into build events.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};

use crate::config::HciConfig;
use crate::events::build::BuildEvent;
use crate::services::coordinator::{Coordinator, CoordinatorError};
use crate::services::github_service;

const NULL_SHA: &str = "0000000000000000000000000000000000000000";

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(
    config: &HciConfig,
    coordinator: &Coordinator,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&config.github_webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    if let Some(repo) = payload["repository"]["full_name"].as_str() {
        if !repo.eq_ignore_ascii_case(&config.github_repo) {
            tracing::debug!(repo, "Ignoring webhook for another repository");
            return Ok(StatusCode::OK);
        }
    }

    match event_type {
        "push" => handle_push(coordinator, &payload).await,
        "check_suite" => handle_check_suite(coordinator, &payload).await,
        "check_run" => handle_check_run(coordinator, &payload).await,
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            Ok(StatusCode::OK)
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            Ok(StatusCode::OK)
        }
    }
}

async fn handle_push(
    coordinator: &Coordinator,
    payload: &serde_json::Value,
) -> Result<StatusCode, StatusCode> {
    let sha = payload["after"].as_str().unwrap_or_default();
    let deleted = payload["deleted"].as_bool().unwrap_or(false);

    if sha.is_empty() || sha == NULL_SHA || deleted {
        return Ok(StatusCode::OK);
    }

    tracing::info!(sha, "GitHub commit pushed");
    request_all_boards(coordinator, sha).await
}

async fn handle_check_suite(
    coordinator: &Coordinator,
    payload: &serde_json::Value,
) -> Result<StatusCode, StatusCode> {
    let action = payload["action"].as_str().unwrap_or_default();
    if action != "requested" && action != "rerequested" {
        return Ok(StatusCode::OK);
    }

    let sha = payload["check_suite"]["head_sha"]
        .as_str()
        .unwrap_or_default();
    if sha.is_empty() {
        return Ok(StatusCode::OK);
    }

    tracing::info!(sha, action, "Check-suite requested");
    request_all_boards(coordinator, sha).await
}

async fn handle_check_run(
    coordinator: &Coordinator,
    payload: &serde_json::Value,
) -> Result<StatusCode, StatusCode> {
    let action = payload["action"].as_str().unwrap_or_default();
    if action != "rerequested" {
        return Ok(StatusCode::OK);
    }

    let sha = payload["check_run"]["head_sha"].as_str().unwrap_or_default();
    let name = payload["check_run"]["name"].as_str().unwrap_or_default();
    if sha.is_empty() || name.is_empty() {
        return Ok(StatusCode::OK);
    }

    let event = BuildEvent::RunRequested {
        sha: sha.to_string(),
        target: name.to_string(),
    };
    match coordinator.handle(event).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        // Check-runs for boards this host doesn't drive are someone else's.
        Err(CoordinatorError::UnknownTarget(_)) => Ok(StatusCode::OK),
        Err(e) => Err(super::coordinator_status(&e)),
    }
}

/// Discover the commit and ask for a run on every registered board.
async fn request_all_boards(
    coordinator: &Coordinator,
    sha: &str,
) -> Result<StatusCode, StatusCode> {
    let mut events = vec![BuildEvent::CommitDiscovered {
        sha: sha.to_string(),
    }];
    events.extend(
        coordinator
            .registry()
            .targets()
            .into_iter()
            .map(|target| BuildEvent::RunRequested {
                sha: sha.to_string(),
                target,
            }),
    );

    for event in events {
        if let Err(e) = coordinator.handle(event).await {
            tracing::error!(sha, "Failed to reduce webhook event: {e}");
            return Err(super::coordinator_status(&e));
        }
    }
    Ok(StatusCode::ACCEPTED)
}
