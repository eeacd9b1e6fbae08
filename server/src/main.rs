#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # pushgate
//!
//! Real-time push server: a WebSocket broadcast relay, a Server-Sent Events
//! stream and static files, all on one HTTP listener set.
//!
//! ## API surface
//!
//! | Method | Path      | Description                                       |
//! |--------|-----------|---------------------------------------------------|
//! | GET    | `/`       | Demo page subscribing to `/ws` and `/events`      |
//! | POST   | `/`       | Echo submitted form fields (urlencoded/multipart) |
//! | GET    | `/ws`     | WebSocket relay: every message goes to every client |
//! | GET    | `/events` | SSE stream of `notification` events               |
//! | *      | *         | Static files from `server.document_root`          |
//!
//! Every connected WebSocket client also receives the current Unix time once
//! per `websocket.heartbeat_interval_ms`.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, CLI, logging, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! admission.rs     — global / per-address connection limits
//! server.rs        — admission-aware listeners, serve loop
//! gateway.rs       — client registry and concurrent broadcast
//! heartbeat.rs     — periodic timestamp broadcast
//! routes/
//!   mod.rs         — RouteTable, default routes, static fallback
//!   index.rs       — GET /
//!   form.rs        — POST /
//!   events.rs      — GET /events
//! ws/
//!   mod.rs         — WebSocket upgrade, origin policy, relay loop
//! ```

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pushgate::{heartbeat, routes, AdmissionController, AppState, Config, Server, ServerError};

/// Real-time push server: WebSocket broadcast, SSE and static files.
#[derive(Parser)]
#[command(name = "pushgate", version)]
struct Cli {
    /// Path to TOML config file (defaults to ./pushgate.toml when present).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pushgate: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    std::panic::set_hook(Box::new(|panic| {
        error!("Panic: {panic}");
    }));

    match run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> Result<(), ServerError> {
    info!("pushgate v{} starting", env!("CARGO_PKG_VERSION"));

    let document_root = config.server.document_root_path();
    tokio::fs::create_dir_all(&document_root)
        .await
        .map_err(|source| ServerError::DocumentRoot {
            path: document_root.display().to_string(),
            source,
        })?;
    info!("Serving static files from {}", document_root.display());

    info!("Request body limit: {}", config.server.post_max_size);

    if !config.websocket.check_origin {
        warn!("WebSocket origin check disabled");
    }

    let admission = AdmissionController::new(
        config.server.max_connections,
        config.server.max_connections_per_ip,
    );
    let server = Server::bind(&config.server.listen, admission).await?;

    let state = AppState::new(config);
    let app = routes::app(state.clone())?;

    let token = CancellationToken::new();
    let heartbeat_task = heartbeat::spawn(
        state.gateway.clone(),
        state.config.websocket.heartbeat_interval(),
        token.clone(),
    );

    info!("Server ready");

    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = server.serve(app, token.clone()).await;

    // Cleanup
    info!("Shutting down...");
    token.cancel();
    let _ = heartbeat_task.await;
    let closed = state.gateway.clear();
    info!(
        clients = closed,
        uptime_secs = state.start_time.elapsed().as_secs(),
        "Goodbye"
    );
    result
}

/// Resolve on SIGINT or SIGTERM. If no handler can be installed, never
/// resolves and the process runs until killed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received SIGINT");
    }
}
