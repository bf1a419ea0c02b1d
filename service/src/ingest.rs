//! Event ingestion: validate, persist, then hand off aggregation.
//!
//! Per request the pipeline is a little state machine:
//!
//! ```text
//! Received → Validated → Persisted → Aggregated → Acknowledged
//!     │          │
//!     └──────────┴──▶ Rejected (validation/persistence failure, nothing stored)
//! ```
//!
//! Everything up to and including the event store commit is synchronous and
//! failures there abort the whole operation. Everything after the commit is
//! fire-and-forget from the caller's point of view: the event is durable,
//! so aggregation hiccups are logged, retried by the worker, and ultimately
//! repaired by replay — never reported as a request failure.

use crate::aggregation::{AggregationJob, AggregationQueue};
use std::sync::Arc;
use tally_core::event::{NewEvent, ValidationError};
use tally_core::event_store::{EventStore, PersistenceError};
use tally_core::ids::EventId;
use tally_core::scoring::ScoringPolicy;
use thiserror::Error;

/// Failure of a `submit` call.
///
/// Both variants mean the event was **not** recorded; failures after the
/// commit are handled internally and never surface here.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The event was rejected before persistence.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The event store refused or could not complete the write.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Accepts new events, persists them, and triggers aggregation.
///
/// Shared across all request handlers; cheap to clone.
#[derive(Clone)]
pub struct IngestionService {
    events: Arc<dyn EventStore>,
    scoring: Arc<dyn ScoringPolicy>,
    queue: AggregationQueue,
}

impl IngestionService {
    /// Create an ingestion service over the given event store and scoring
    /// rules, enqueueing aggregation work onto `queue`.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        scoring: Arc<dyn ScoringPolicy>,
        queue: AggregationQueue,
    ) -> Self {
        Self {
            events,
            scoring,
            queue,
        }
    }

    /// Record an event and schedule its counter update.
    ///
    /// Returns the committed event's id. The point delta is computed here —
    /// once, from the validated event — and travels with the aggregation
    /// job, so retries can never recompute a different value.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Validation`]: malformed input, nothing persisted
    /// - [`SubmitError::Persistence`]: the event store write failed, nothing
    ///   persisted
    pub async fn submit(&self, event: NewEvent) -> Result<EventId, SubmitError> {
        event.validate()?;

        let delta = self.scoring.delta(event.event_type, &event.details);
        let achievement = self.scoring.achievement(event.event_type);

        let record = self.events.append(event).await?;

        metrics::counter!("ingest.accepted", "event_type" => record.event_type.as_str())
            .increment(1);

        // Past the commit: the operation is logically successful no matter
        // what happens below. There is no await between here and the
        // enqueue, so request cancellation cannot separate the two; a
        // cancellation that lands inside `append` itself leaves a committed
        // event that read-path reconciliation picks up.
        let job = AggregationJob {
            event_id: record.id,
            user_id: record.user_id,
            delta,
            achievement,
        };

        if let Err(e) = self.queue.enqueue(job) {
            tracing::error!(
                event_id = %record.id,
                user_id = %record.user_id,
                delta = delta,
                error = %e,
                "Event committed but aggregation could not be queued; replay will repair the counter"
            );
            metrics::counter!("ingest.aggregation_unqueued").increment(1);
        }

        tracing::info!(
            event_id = %record.id,
            user_id = %record.user_id,
            event_type = %record.event_type,
            delta = delta,
            "Event accepted"
        );

        Ok(record.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationWorker;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use tally_core::counter_store::CounterStore;
    use tally_core::event::EventType;
    use tally_core::ids::UserId;
    use tally_core::scoring::StandardScoring;
    use tally_testing::mocks::{
        InMemoryAchievementStore, InMemoryCounterStore, InMemoryEventStore, InMemoryStatsCache,
    };

    struct Fixture {
        events: Arc<InMemoryEventStore>,
        counters: Arc<InMemoryCounterStore>,
        service: IngestionService,
        worker_handle: tokio::task::JoinHandle<()>,
        queue: AggregationQueue,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(InMemoryEventStore::new());
        let counters = Arc::new(InMemoryCounterStore::new());
        let achievements = Arc::new(InMemoryAchievementStore::new());
        let cache = Arc::new(InMemoryStatsCache::new());

        let (queue, rx) = AggregationQueue::new();
        let worker = AggregationWorker::new(
            Arc::clone(&counters) as _,
            achievements as _,
            cache as _,
            RetryPolicy::no_retries(),
        );
        let worker_handle = worker.spawn(rx);

        let service = IngestionService::new(
            Arc::clone(&events) as _,
            Arc::new(StandardScoring) as _,
            queue.clone(),
        );

        Fixture {
            events,
            counters,
            service,
            worker_handle,
            queue,
        }
    }

    /// Drop the producers and wait for the worker to drain the queue.
    async fn settle(fixture: Fixture) -> Fixture {
        let Fixture {
            events,
            counters,
            service,
            worker_handle,
            queue,
        } = fixture;
        drop(service);
        drop(queue);
        worker_handle.await.unwrap();
        // Rebuild a service for any further (non-aggregating) assertions.
        let (dead_queue, _rx) = AggregationQueue::new();
        let service = IngestionService::new(
            Arc::clone(&events) as _,
            Arc::new(StandardScoring) as _,
            dead_queue.clone(),
        );
        let worker_handle = tokio::spawn(async {});
        Fixture {
            events,
            counters,
            service,
            worker_handle,
            queue: dead_queue,
        }
    }

    #[tokio::test]
    async fn submit_persists_and_aggregates() {
        let fx = fixture();

        let event_id = fx
            .service
            .submit(NewEvent::new(
                UserId::new(2),
                EventType::CompleteLevel,
                json!({"level": 30}),
            ))
            .await
            .unwrap();

        let fx = settle(fx).await;

        assert_eq!(fx.events.len(), 1);
        // complete_level at level 30 contributes 20 + 30 points.
        assert_eq!(fx.counters.get(UserId::new(2)).await.unwrap(), Some(50));
        assert!(fx.counters.is_applied(event_id));
    }

    #[tokio::test]
    async fn invalid_event_is_rejected_before_persistence() {
        let fx = fixture();

        let result = fx
            .service
            .submit(NewEvent::new(
                UserId::new(2),
                EventType::CompleteLevel,
                json!({"level": 0}),
            ))
            .await;

        assert!(matches!(result, Err(SubmitError::Validation(_))));
        assert!(fx.events.is_empty(), "Rejected events must leave no trace");
    }

    #[tokio::test]
    async fn persistence_failure_aborts_without_aggregation() {
        let fx = fixture();
        fx.events.fail_next_calls(1);

        let result = fx
            .service
            .submit(NewEvent::new(UserId::new(1), EventType::Login, json!({})))
            .await;

        assert!(matches!(result, Err(SubmitError::Persistence(_))));

        let fx = settle(fx).await;
        assert_eq!(fx.counters.get(UserId::new(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_submits_never_lose_updates() {
        let fx = fixture();
        let user = UserId::new(5);

        // find_secret (+50) and login (+5) submits interleaved 10 times each.
        let mut handles = Vec::new();
        for _ in 0..10 {
            let service = fx.service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .submit(NewEvent::new(user, EventType::FindSecret, json!({})))
                    .await
            }));
            let service = fx.service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .submit(NewEvent::new(user, EventType::Login, json!({})))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let fx = settle(fx).await;
        assert_eq!(
            fx.counters.get(user).await.unwrap(),
            Some(10 * 50 + 10 * 5),
            "Final counter must equal the sum of all deltas, regardless of interleaving"
        );
    }

    #[tokio::test]
    async fn queue_shutdown_does_not_fail_the_submit() {
        let events = Arc::new(InMemoryEventStore::new());
        let (queue, rx) = AggregationQueue::new();
        drop(rx); // worker gone

        let service = IngestionService::new(
            Arc::clone(&events) as _,
            Arc::new(StandardScoring) as _,
            queue,
        );

        // The write still succeeds: the event is durable and replay repairs
        // the counter later.
        let result = service
            .submit(NewEvent::new(UserId::new(1), EventType::Login, json!({})))
            .await;
        assert!(result.is_ok());
        assert_eq!(events.len(), 1);
    }
}
