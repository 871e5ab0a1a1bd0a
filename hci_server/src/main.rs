//! TinyHCI Server: hardware-in-the-loop CI for microcontroller boards.
//!
//! Receives GitHub webhooks and CI buildhooks, installs each commit's
//! toolchain, then flashes and tests every attached board in turn,
//! reporting progress back as GitHub check-runs.

mod config;
mod events;
mod metrics;
mod models;
mod routes;
mod services;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;

use services::artifact_service::ToolchainInstaller;
use services::board_driver::ShellBoardDriver;
use services::board_registry::BoardRegistry;
use services::github_auth::GithubAuth;
use services::coordinator::{Coordinator, Timing};
use services::github_service::GithubChecks;

#[derive(Parser)]
#[command(name = "tinyhci", about = "TinyHCI hardware CI server")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "HCI_PORT", default_value = "8000")]
    port: u16,

    /// JSON file describing the attached boards (defaults to the builtin set)
    #[arg(long, env = "HCI_BOARDS")]
    boards: Option<PathBuf>,

    /// Directory board flash/test commands run in
    #[arg(long, env = "HCI_BOARD_DIR")]
    board_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting TinyHCI server...");

    let config = config::HciConfig::from_env();

    let registry = match &cli.boards {
        Some(path) => BoardRegistry::from_file(path)?,
        None => BoardRegistry::builtin(),
    };
    tracing::info!(boards = ?registry.targets(), "Board registry loaded");

    // Collaborators
    let reporter = Arc::new(GithubChecks::new(
        &config.github_api_url,
        &config.github_repo,
        GithubAuth::from_config(&config)?,
        config.report_timeout(),
    ));
    let builder = Arc::new(ToolchainInstaller::new(
        &config.work_dir,
        &config.install_prefix,
        config.build_timeout(),
    ));
    let driver = Arc::new(ShellBoardDriver::new(cli.board_dir.clone()));

    let (coordinator, queue) = Coordinator::new(
        Arc::new(registry),
        reporter,
        builder,
        driver,
        Timing::from_config(&config),
    );

    // Background tasks
    let worker = tokio::spawn(coordinator.clone().run_worker(queue));
    let sweeper = coordinator
        .clone()
        .spawn_eviction(config.retention(), config.evict_interval());

    let state = routes::HciRouterState {
        coordinator,
        config,
    };
    let app = routes::hci_router(state).layer(TraceLayer::new_for_http());

    // Initialize metrics
    metrics::init_metrics();

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("TinyHCI server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // A board cycle in progress is abandoned; kill_on_drop reaps its process.
    tracing::info!("Stopping build worker...");
    sweeper.abort();
    worker.abort();
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
