//! Route table and middleware stack.

use crate::handlers;
use crate::state::AppState;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
///
/// Routes mirror the service's two boundary operations plus the usual
/// operational endpoints:
///
/// - `POST /api/v1/events/event` — record an event
/// - `GET  /api/v1/users/stats/:user_id` — read a user's aggregate
/// - `GET  /health`, `GET /health/ready`, `GET /metrics`
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/events/event", post(handlers::events::post_event))
        .route(
            "/api/v1/users/stats/:user_id",
            get(handlers::stats::get_stats),
        )
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
