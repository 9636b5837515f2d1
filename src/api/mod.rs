//! HTTP layer: route handlers, transports and router composition.

pub mod handlers;

use axum::Router;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::transport::sse::sse_handler;
use crate::transport::ws::ws_handler;

/// OpenAPI document of the HTTP surface.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "fanout-gateway",
        description = "Real-time publish/subscribe gateway"
    ),
    paths(
        handlers::system::health_handler,
        handlers::system::stats_handler,
        handlers::broadcast::broadcast_handler,
        crate::transport::ws::ws_handler,
        crate::transport::sse::sse_handler,
    ),
    components(schemas(
        handlers::system::HealthResponse,
        handlers::system::StatsResponse,
        crate::error::ErrorResponse,
        crate::error::ErrorBody,
    ))
)]
pub struct ApiDoc;

/// Builds the complete API router with HTTP endpoints and transports.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .merge(handlers::routes())
        .route("/ws", get(ws_handler))
        .route("/events", get(sse_handler));

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()),
    );

    router
}

/// Builds the served application: routes, middleware and state.
pub fn build_app(state: AppState) -> Router {
    build_router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
