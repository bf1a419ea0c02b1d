//! Replay-based reconciliation of counters against the event log.
//!
//! The event store is authoritative; whenever a counter is missing or
//! suspect, the correct value is simply the sum of the scoring deltas of
//! every committed event for that user. Reconciliation computes that sum by
//! streaming [`EventStore::replay`] and writes it back with
//! [`CounterStore::rebuild`], which also restores the per-event processed
//! markers so in-flight aggregation retries stay exactly-once.

use futures::TryStreamExt;
use std::sync::Arc;
use tally_core::counter_store::CounterStore;
use tally_core::event_store::{EventStore, PersistenceError};
use tally_core::ids::{EventId, UserId};
use tally_core::scoring::ScoringPolicy;
use tally_core::stats::ReconciliationError;

/// Rebuilds a user's counter from the authoritative event log.
#[derive(Clone)]
pub struct Reconciler {
    events: Arc<dyn EventStore>,
    counters: Arc<dyn CounterStore>,
    scoring: Arc<dyn ScoringPolicy>,
}

impl Reconciler {
    /// Create a reconciler over the given stores and scoring rules.
    ///
    /// Must use the same [`ScoringPolicy`] as ingestion, or replayed sums
    /// will drift from incrementally aggregated ones.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        counters: Arc<dyn CounterStore>,
        scoring: Arc<dyn ScoringPolicy>,
    ) -> Self {
        Self {
            events,
            counters,
            scoring,
        }
    }

    /// Recompute a user's score purely from the event log.
    ///
    /// Returns the sum and the ids of the events that compose it. A user
    /// with no events sums to 0.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the replay stream fails.
    pub async fn replay_sum(
        &self,
        user_id: UserId,
    ) -> Result<(i64, Vec<EventId>), PersistenceError> {
        let mut stream = self.events.replay(user_id);
        let mut sum = 0_i64;
        let mut event_ids = Vec::new();

        while let Some(record) = stream.try_next().await? {
            sum += self.scoring.delta(record.event_type, &record.details);
            event_ids.push(record.id);
        }

        Ok((sum, event_ids))
    }

    /// Recompute a user's score and overwrite the counter with it.
    ///
    /// Returns the reconciled score. Safe to run at any time: the rebuild
    /// restores processed markers alongside the counter, so a concurrent or
    /// later aggregation retry of an already-replayed event is a no-op.
    ///
    /// # Errors
    ///
    /// - [`ReconciliationError::Replay`]: the event log could not be read
    /// - [`ReconciliationError::Counter`]: the recomputed value could not
    ///   be written back
    pub async fn reconcile_user(&self, user_id: UserId) -> Result<i64, ReconciliationError> {
        let (sum, event_ids) = self.replay_sum(user_id).await?;
        let replayed = event_ids.len();

        self.counters.rebuild(user_id, sum, event_ids).await?;

        tracing::info!(
            user_id = %user_id,
            score = sum,
            events = replayed,
            "Counter reconciled from event log"
        );
        metrics::counter!("reconciliation.runs").increment(1);

        Ok(sum)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::event::{EventType, NewEvent};
    use tally_core::scoring::StandardScoring;
    use tally_testing::mocks::{InMemoryCounterStore, InMemoryEventStore};

    fn reconciler(
        events: &Arc<InMemoryEventStore>,
        counters: &Arc<InMemoryCounterStore>,
    ) -> Reconciler {
        Reconciler::new(
            Arc::clone(events) as _,
            Arc::clone(counters) as _,
            Arc::new(StandardScoring) as _,
        )
    }

    #[tokio::test]
    async fn reconcile_rebuilds_counter_from_events() {
        let events = Arc::new(InMemoryEventStore::new());
        let counters = Arc::new(InMemoryCounterStore::new());
        let user = UserId::new(2);

        events
            .append(NewEvent::new(user, EventType::Login, json!({})))
            .await
            .unwrap();
        events
            .append(NewEvent::new(
                user,
                EventType::CompleteLevel,
                json!({"level": 30}),
            ))
            .await
            .unwrap();

        let score = reconciler(&events, &counters)
            .reconcile_user(user)
            .await
            .unwrap();

        assert_eq!(score, 5 + 50);
        assert_eq!(counters.get(user).await.unwrap(), Some(55));
    }

    #[tokio::test]
    async fn reconcile_of_user_without_events_is_zero() {
        let events = Arc::new(InMemoryEventStore::new());
        let counters = Arc::new(InMemoryCounterStore::new());

        let score = reconciler(&events, &counters)
            .reconcile_user(UserId::new(42))
            .await
            .unwrap();

        assert_eq!(score, 0);
        assert_eq!(counters.get(UserId::new(42)).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn reconcile_marks_replayed_events_as_applied() {
        let events = Arc::new(InMemoryEventStore::new());
        let counters = Arc::new(InMemoryCounterStore::new());
        let user = UserId::new(3);

        let record = events
            .append(NewEvent::new(user, EventType::FindSecret, json!({})))
            .await
            .unwrap();

        reconciler(&events, &counters)
            .reconcile_user(user)
            .await
            .unwrap();

        // A late aggregation retry for the replayed event must be a no-op.
        let outcome = counters.apply_delta(user, record.id, 50).await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(counters.get(user).await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn replay_failure_surfaces_as_reconciliation_error() {
        let events = Arc::new(InMemoryEventStore::new());
        let counters = Arc::new(InMemoryCounterStore::new());
        events.fail_next_calls(1);

        let result = reconciler(&events, &counters)
            .reconcile_user(UserId::new(1))
            .await;

        assert!(matches!(result, Err(ReconciliationError::Replay(_))));
    }

    #[tokio::test]
    async fn counter_failure_surfaces_as_reconciliation_error() {
        let events = Arc::new(InMemoryEventStore::new());
        let counters = Arc::new(InMemoryCounterStore::new());
        counters.fail_next_calls(1);

        let result = reconciler(&events, &counters)
            .reconcile_user(UserId::new(1))
            .await;

        assert!(matches!(result, Err(ReconciliationError::Counter(_))));
    }
}
