//! TinyHCI HTTP routes: GitHub webhook, CI buildhook, build API.

pub mod api;
pub mod buildhook;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::config::HciConfig;
use crate::services::coordinator::{Coordinator, CoordinatorError};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct HciRouterState {
    pub coordinator: Arc<Coordinator>,
    pub config: HciConfig,
}

/// Build the server's Axum router.
pub fn hci_router(state: HciRouterState) -> Router {
    Router::new()
        // Ingress
        .route("/webhooks", post(webhook_handler))
        .route("/buildhook", post(buildhook_handler))
        // Build API
        .route("/api/builds", get(list_builds_handler))
        .route("/api/builds/{sha}", get(get_build_handler))
        .route("/api/builds/{sha}/runs/{target}", post(request_run_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Map a rejected event onto an HTTP status.
pub(crate) fn coordinator_status(e: &CoordinatorError) -> StatusCode {
    match e {
        CoordinatorError::UnknownTarget(_) => StatusCode::NOT_FOUND,
        CoordinatorError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// ── Ingress ──

async fn webhook_handler(
    State(state): State<HciRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state.config, &state.coordinator, &headers, body).await
}

async fn buildhook_handler(
    State(state): State<HciRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    crate::metrics::webhook_received("buildhook");
    buildhook::handle_buildhook(&state.config, &state.coordinator, &headers, body).await
}

// ── Build API ──

#[derive(serde::Deserialize)]
pub struct ListBuildsQuery {
    pub limit: Option<usize>,
}

async fn list_builds_handler(
    State(state): State<HciRouterState>,
    Query(query): Query<ListBuildsQuery>,
) -> Json<Vec<api::BuildJson>> {
    Json(api::list_builds(&state.coordinator, query.limit.unwrap_or(20)).await)
}

async fn get_build_handler(
    State(state): State<HciRouterState>,
    Path(sha): Path<String>,
) -> Result<Json<api::BuildJson>, StatusCode> {
    api::get_build(&state.coordinator, &sha)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn request_run_handler(
    State(state): State<HciRouterState>,
    Path((sha, target)): Path<(String, String)>,
) -> Result<(StatusCode, Json<api::BuildJson>), StatusCode> {
    api::request_run(&state.coordinator, &sha, &target)
        .await
        .map(|build| (StatusCode::ACCEPTED, Json(build)))
        .map_err(|e| {
            tracing::warn!(sha = %sha, "Manual run rejected: {e}");
            coordinator_status(&e)
        })
}

async fn health_handler(State(state): State<HciRouterState>) -> Json<api::HealthJson> {
    Json(api::health(&state.coordinator).await)
}
