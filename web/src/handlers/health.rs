//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems to
//! verify service health.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tally_core::counter_store::CounterStore;
use tally_core::event_store::EventStore;
use tally_core::ids::UserId;

/// Readiness report for one dependency.
#[derive(Debug, Serialize)]
pub struct DependencyHealth {
    /// Dependency name.
    pub component: &'static str,
    /// Whether the last probe succeeded.
    pub healthy: bool,
}

/// Readiness report.
#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    /// Per-dependency status.
    pub dependencies: Vec<DependencyHealth>,
}

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the process is running. Does NOT check
/// dependencies.
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Readiness check: probes the event store and the counter store.
///
/// - 200 OK: both stores reachable
/// - 503 Service Unavailable: at least one store unreachable
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessReport>) {
    // Cheap indexed probes against both backends.
    let probe_user = UserId::new(1);
    let event_store_ok = state.events.recent_event_types(probe_user, 1).await.is_ok();
    let counter_store_ok = state.counters.get(probe_user).await.is_ok();

    let report = ReadinessReport {
        dependencies: vec![
            DependencyHealth {
                component: "event_store",
                healthy: event_store_ok,
            },
            DependencyHealth {
                component: "counter_store",
                healthy: counter_store_ok,
            },
        ],
    };

    let status = if event_store_ok && counter_store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

/// Prometheus metrics exposition.
///
/// Returns 404 when no recorder was installed (e.g. in tests).
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    state.metrics.as_ref().map_or_else(
        || (StatusCode::NOT_FOUND, String::new()),
        |handle| (StatusCode::OK, handle.render()),
    )
}
