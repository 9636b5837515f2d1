//! Backplane entrypoint: publishers POST pub/sub envelopes here.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;

use crate::app_state::AppState;
use crate::error::GatewayError;

/// `POST /_broadcast` — Publish a stream message or a remote command.
///
/// The body is either `{"stream": "...", "data": "..."}` or
/// `{"command": "disconnect", "payload": {"identifier": "...", "reconnect": false}}`.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] if the body is neither.
#[utoipa::path(
    post,
    path = "/_broadcast",
    tag = "Backplane",
    summary = "Publish to the node",
    description = "Hands a broadcast or remote command to the broker, which fans it out to local subscribers.",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 202, description = "Accepted for fan-out"),
        (status = 400, description = "Malformed pub/sub message", body = crate::error::ErrorResponse),
    )
)]
pub async fn broadcast_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, GatewayError> {
    state.node.handle_pubsub(&body).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Backplane routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/_broadcast", post(broadcast_handler))
}
