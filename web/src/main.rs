//! The tally server binary.
//!
//! Wires the production stores (Postgres event log, Redis counters) to the
//! ingestion/aggregation/stats services and serves the HTTP API.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tally_core::counter_store::CounterStore;
use tally_core::event_store::EventStore;
use tally_core::scoring::{ScoringPolicy, StandardScoring};
use tally_postgres::{PostgresAchievementStore, PostgresEventStore};
use tally_redis::RedisCounterStore;
use tally_service::{
    AggregationQueue, AggregationWorker, IngestionService, Reconciler, RetryPolicy, StatsService,
};
use tally_web::{AppState, Settings, router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_web=info,tally_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env().context("Failed to load settings")?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Stores. The event store is connected (and migrated) first: it is the
    // source of truth and nothing works without it. Redis being down at
    // boot is survivable — reads fall back to replay and the worker
    // retries — so the counter store connection failing is fatal only
    // because it signals misconfiguration.
    let event_store = PostgresEventStore::connect(&settings.database_url, settings.pg_max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    event_store
        .migrate()
        .await
        .context("Failed to run migrations")?;

    let achievement_store = PostgresAchievementStore::new(event_store.pool().clone());

    let counter_store = RedisCounterStore::new(&settings.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let stats_cache = counter_store.stats_cache();

    let events: Arc<dyn EventStore> = Arc::new(event_store);
    let counters: Arc<dyn CounterStore> = Arc::new(counter_store);
    let achievements = Arc::new(achievement_store);
    let cache = Arc::new(stats_cache);
    let scoring: Arc<dyn ScoringPolicy> = Arc::new(StandardScoring);

    // Aggregation pipeline.
    let (queue, queue_rx) = AggregationQueue::new();
    let worker = AggregationWorker::new(
        Arc::clone(&counters),
        Arc::clone(&achievements) as _,
        Arc::clone(&cache) as _,
        RetryPolicy::default().with_max_retries(settings.aggregation_max_retries),
    );
    let worker_handle = worker.spawn(queue_rx);

    // Services.
    let ingestion = IngestionService::new(Arc::clone(&events), Arc::clone(&scoring), queue);
    let reconciler = Reconciler::new(
        Arc::clone(&events),
        Arc::clone(&counters),
        Arc::clone(&scoring),
    );
    let stats = StatsService::new(
        Arc::clone(&events),
        Arc::clone(&counters),
        Arc::clone(&achievements) as _,
        Arc::clone(&cache) as _,
        reconciler,
        settings.stats_cache_ttl,
    );

    let state = AppState::new(ingestion, stats, events, counters).with_metrics(prometheus);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "tally-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router (and with it every queue producer) is gone; wait for the
    // worker to drain whatever aggregation work is still in flight.
    tracing::info!("Server stopped, draining aggregation queue");
    worker_handle.await.context("Aggregation worker panicked")?;

    Ok(())
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
