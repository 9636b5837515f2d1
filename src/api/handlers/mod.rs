//! HTTP endpoint handlers.

pub mod broadcast;
pub mod system;

use axum::Router;

use crate::app_state::AppState;

/// Composes the HTTP routes (transports excluded).
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(system::routes())
        .merge(broadcast::routes())
}
