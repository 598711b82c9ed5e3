//! The in-sandbox bridge: one process exposing everything the orchestrator
//! needs over a single port: a health probe, the orchestrator WebSocket,
//! and the loopback HTTP routes the MCP terminal adapter calls.

pub mod agent;
pub mod error;
pub mod http;
pub mod ports;
pub mod state;
pub mod terminal;
pub mod watcher;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::BridgeState;

/// Build the axum Router for the bridge. Used by `serve()` and by route
/// tests.
pub fn build_router(state: Arc<BridgeState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let internal = Router::new()
        .route("/internal/terminal-create", post(http::terminal_create))
        .route("/internal/terminal-write", post(http::terminal_write))
        .route("/internal/terminal-read", post(http::terminal_read))
        .route("/internal/terminal-close", post(http::terminal_close))
        .route("/internal/terminal-list", get(http::terminal_list))
        .route("/internal/preview-url", post(http::preview_url))
        .route("/internal/ask-user", post(http::ask_user))
        .layer(axum::middleware::from_fn(http::require_loopback));

    Router::new()
        // Health probe and orchestrator WebSocket share the root URL.
        .route("/", get(ws::root))
        .merge(internal)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and run the bridge until shutdown.
pub async fn serve(state: Arc<BridgeState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("bridge listening on http://{addr}");

    watcher::spawn_watcher(state.clone());
    ports::spawn_scanner(state.clone());

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
    }
    tracing::info!("shutdown signal received");
}
