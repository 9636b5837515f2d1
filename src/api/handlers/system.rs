//! System endpoints: health check and node statistics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::error::GatewayError;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    broker: String,
}

/// Node statistics.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    /// Registered sessions.
    pub sessions: usize,
    /// Streams with at least one local subscriber.
    pub streams: usize,
    /// Controller disconnect notifications not yet delivered.
    pub pending_disconnects: usize,
}

/// `GET /health` — Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health status, version, active broker and current timestamp.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            broker: state.node.broker().announce(),
        }),
    )
}

/// `GET /stats` — Session and stream counters.
///
/// # Errors
///
/// Returns [`GatewayError::Stopped`] while the node is shutting down.
#[utoipa::path(
    get,
    path = "/stats",
    tag = "System",
    summary = "Node statistics",
    description = "Returns the number of registered sessions, followed streams and pending disconnect notifications.",
    responses(
        (status = 200, description = "Current counters", body = StatsResponse),
        (status = 503, description = "Node is shutting down", body = crate::error::ErrorResponse),
    )
)]
pub async fn stats_handler(
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, GatewayError> {
    let hub = state.node.hub().stats().await?;
    Ok(Json(StatsResponse {
        sessions: hub.sessions,
        streams: hub.streams,
        pending_disconnects: state.node.pending_disconnects(),
    }))
}

/// System routes mounted at the root level.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
}
