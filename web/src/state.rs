//! Application state shared across all HTTP handlers.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tally_core::counter_store::CounterStore;
use tally_core::event_store::EventStore;
use tally_service::{IngestionService, StatsService};

/// Everything a handler needs, cloned cheaply per request.
///
/// The raw store handles exist only for the readiness probe; request
/// handlers always go through the services.
#[derive(Clone)]
pub struct AppState {
    /// Write path.
    pub ingestion: IngestionService,
    /// Read path.
    pub stats: StatsService,
    /// Event store handle for readiness checks.
    pub events: Arc<dyn EventStore>,
    /// Counter store handle for readiness checks.
    pub counters: Arc<dyn CounterStore>,
    /// Prometheus exposition handle, when the recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Bundle services and store handles into handler state.
    #[must_use]
    pub fn new(
        ingestion: IngestionService,
        stats: StatsService,
        events: Arc<dyn EventStore>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            ingestion,
            stats,
            events,
            counters,
            metrics: None,
        }
    }

    /// Attach a Prometheus handle, enabling the `/metrics` route.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
