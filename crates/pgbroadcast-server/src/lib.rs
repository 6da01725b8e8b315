//! pgbroadcast WebSocket server.
//!
//! Exposes the fan-out engine from `pgbroadcast-core` over HTTP: clients open
//! a WebSocket on `/ws`, send table names as text frames and receive the
//! matching change envelopes as JSON.

pub mod config;
pub mod error;
pub mod routes;
pub mod ws;

pub use config::{Args, ServerConfig};
pub use error::AppError;

use axum::routing::get;
use axum::Router;
use pgbroadcast_core::{HubHandle, UpstreamState};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the fan-out hub.
    pub hub: HubHandle,
    /// Upstream listener connectivity.
    pub upstream: watch::Receiver<UpstreamState>,
    /// Server configuration.
    pub config: ServerConfig,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        hub: HubHandle,
        upstream: watch::Receiver<UpstreamState>,
        config: ServerConfig,
    ) -> Self {
        Self {
            hub,
            upstream,
            config,
        }
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::routes())
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
