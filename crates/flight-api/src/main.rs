//! # Flight API Server
//!
//! Main entry point for the real-time flight tracking engine.
//! Serves the REST API, runs the observer WebSocket server and owns the
//! background work: the tracking engine, the idle session reaper and zone
//! cache housekeeping.

mod auth;
mod config;
mod error;
mod handlers;
mod routes;
mod state;

use crate::config::ApiConfig;
use crate::routes::create_router;
use crate::state::{connect_store, AppState};

use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ApiConfig::from_env();

    // Initialize logging
    init_logging();

    info!("🚁 Starting Flight Tracking Server v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("Configuration loaded");
    info!("   API Port: {}", config.api_port);
    info!("   WebSocket Port: {}", config.ws_port);
    info!("   Store: {}", config.store_backend.as_str());
    info!("   ScyllaDB Hosts: {:?}", config.db.hosts);
    info!("   Engine workers: {}", config.tracker.engine_workers);
    if config.uses_dev_secret() {
        warn!("JWT_SECRET is not set, using the development secret");
    }

    // Initialize application state
    let (store, backend) = connect_store(&config).await;
    let state = AppState::new(config.clone(), store, backend)?;
    info!("Application state initialized");

    let shutdown = CancellationToken::new();

    // Reaper and zone cache housekeeping
    let background = state.tracker.spawn_background(shutdown.clone());

    // Start WebSocket server in background
    let ws_hub = state.ws_hub.clone();
    let ws_auth = state.jwt.clone();
    let ws_port = config.ws_port;
    let ws_shutdown = shutdown.clone();
    let ws_server = tokio::spawn(async move {
        info!("Starting WebSocket server on port {}...", ws_port);
        if let Err(e) = flight_websocket::start_server(ws_hub, ws_auth, ws_port, ws_shutdown).await {
            error!("WebSocket server error: {}", e);
        }
    });

    // Create router
    let app = create_router(state.clone());
    info!("Routes configured");

    // Start API server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🚀 API server listening on http://{}", addr);
    info!("WebSocket server on ws://0.0.0.0:{}", config.ws_port);
    info!("Metrics available at http://{}/metrics", addr);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let signal_token = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await?;

    // Stop background tasks, then drain queued derived-state work
    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            error!("Background task failed to stop cleanly: {}", e);
        }
    }
    if let Err(e) = ws_server.await {
        error!("WebSocket server task failed: {}", e);
    }
    state.tracker.shutdown().await;

    info!("🛑 Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing. `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,flight_api=debug,flight_tracker=debug,flight_websocket=debug")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        }
    }
}
