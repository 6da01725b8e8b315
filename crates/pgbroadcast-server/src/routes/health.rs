//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use pgbroadcast_core::{HubStats, UpstreamState};
use serde::Serialize;

use crate::error::AppError;
use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" while the upstream listener is connected, else "degraded".
    pub status: String,
    /// Service name.
    pub service: String,
    /// Server version.
    pub version: String,
    /// Upstream listener state.
    pub upstream: UpstreamState,
    /// Hub counters.
    pub hub: HubStats,
}

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let hub = state.hub.stats().await?;
    let upstream = *state.upstream.borrow();

    Ok(Json(HealthResponse {
        status: if upstream == UpstreamState::Connected {
            "healthy"
        } else {
            "degraded"
        }
        .to_string(),
        service: "pgbroadcast".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        upstream,
        hub,
    }))
}
