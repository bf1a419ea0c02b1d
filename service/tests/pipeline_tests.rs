//! End-to-end pipeline tests over in-memory stores: ingestion, aggregation
//! worker, stats reads and reconciliation wired together the way the server
//! binary wires them.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tally_core::counter_store::CounterStore;
use tally_core::event::{EventType, NewEvent};
use tally_core::event_store::EventStore;
use tally_core::ids::UserId;
use tally_core::scoring::{ScoringPolicy, StandardScoring};
use tally_core::stats::StatsCache;
use tally_service::{
    AggregationQueue, AggregationWorker, IngestionService, Reconciler, RetryPolicy, StatsService,
};
use tally_testing::mocks::{
    InMemoryAchievementStore, InMemoryCounterStore, InMemoryEventStore, InMemoryStatsCache,
};

struct Pipeline {
    events: Arc<InMemoryEventStore>,
    counters: Arc<InMemoryCounterStore>,
    cache: Arc<InMemoryStatsCache>,
    ingestion: IngestionService,
    stats: StatsService,
    queue: AggregationQueue,
    worker_handle: tokio::task::JoinHandle<()>,
}

/// Everything that survives a [`Pipeline::drain`].
struct Drained {
    events: Arc<InMemoryEventStore>,
    counters: Arc<InMemoryCounterStore>,
    cache: Arc<InMemoryStatsCache>,
    stats: StatsService,
}

fn pipeline() -> Pipeline {
    let events = Arc::new(InMemoryEventStore::new());
    let counters = Arc::new(InMemoryCounterStore::new());
    let achievements = Arc::new(InMemoryAchievementStore::new());
    let cache = Arc::new(InMemoryStatsCache::new());
    let scoring: Arc<dyn ScoringPolicy> = Arc::new(StandardScoring);

    let (queue, rx) = AggregationQueue::new();
    let worker = AggregationWorker::new(
        Arc::clone(&counters) as _,
        Arc::clone(&achievements) as _,
        Arc::clone(&cache) as _,
        RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2)),
    );
    let worker_handle = worker.spawn(rx);

    let ingestion = IngestionService::new(
        Arc::clone(&events) as _,
        Arc::clone(&scoring),
        queue.clone(),
    );

    let reconciler = Reconciler::new(
        Arc::clone(&events) as _,
        Arc::clone(&counters) as _,
        Arc::clone(&scoring),
    );
    let stats = StatsService::new(
        Arc::clone(&events) as _,
        Arc::clone(&counters) as _,
        Arc::clone(&achievements) as _,
        Arc::clone(&cache) as _,
        reconciler,
        Duration::from_secs(60),
    );

    Pipeline {
        events,
        counters,
        cache,
        ingestion,
        stats,
        queue,
        worker_handle,
    }
}

impl Pipeline {
    /// Shut down producers and wait for the worker to drain the queue.
    async fn drain(self) -> Drained {
        let Self {
            events,
            counters,
            cache,
            ingestion,
            stats,
            queue,
            worker_handle,
        } = self;
        drop(ingestion);
        drop(queue);
        worker_handle.await.unwrap();
        Drained {
            events,
            counters,
            cache,
            stats,
        }
    }
}

#[tokio::test]
async fn complete_level_adds_level_points_to_prior_score() {
    let pipeline = pipeline();
    let user = UserId::new(2);

    // Prior score from an earlier login.
    pipeline
        .ingestion
        .submit(NewEvent::new(user, EventType::Login, json!({})))
        .await
        .unwrap();

    let event_id = pipeline
        .ingestion
        .submit(NewEvent::new(
            user,
            EventType::CompleteLevel,
            json!({"level": 30}),
        ))
        .await
        .unwrap();

    let drained = pipeline.drain().await;

    assert!(drained.counters.is_applied(event_id));
    let view = drained.stats.get_stats(user).await.unwrap();
    assert_eq!(view.score, 5 + (20 + 30));
    assert!(view.achievements.contains(&"Master".to_string()));
}

#[tokio::test]
async fn concurrent_submits_for_one_user_sum_exactly() {
    let pipeline = pipeline();
    let user = UserId::new(5);

    // Deltas +50 and +5 raced 20 times each; no update may be lost.
    let mut handles = Vec::new();
    for _ in 0..20 {
        for event_type in [EventType::FindSecret, EventType::Login] {
            let ingestion = pipeline.ingestion.clone();
            handles.push(tokio::spawn(async move {
                ingestion
                    .submit(NewEvent::new(user, event_type, json!({})))
                    .await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let drained = pipeline.drain().await;
    assert_eq!(
        drained.counters.get(user).await.unwrap(),
        Some(20 * 50 + 20 * 5)
    );
}

#[tokio::test]
async fn crash_between_commit_and_increment_is_healed_by_reconciliation() {
    let pipeline = pipeline();
    let user = UserId::new(6);

    // Simulate the crash window: the event commits but the process dies
    // before the aggregation job is consumed. Appending directly to the
    // store (bypassing the queue) leaves exactly that state.
    pipeline
        .events
        .append(NewEvent::new(user, EventType::FindSecret, json!({})))
        .await
        .unwrap();
    pipeline
        .ingestion
        .submit(NewEvent::new(user, EventType::Login, json!({})))
        .await
        .unwrap();

    let drained = pipeline.drain().await;

    // Counter reflects only the queued event so far: the log is ahead of
    // the cache, never the reverse.
    assert_eq!(drained.counters.get(user).await.unwrap(), Some(5));

    // Wipe the counter (and the cached response that would mask it): the
    // read path must land on the full replay sum.
    drained.counters.wipe();
    drained.cache.invalidate(user).await.unwrap();

    let rebuilt = drained.stats.get_stats(user).await.unwrap();
    assert_eq!(rebuilt.score, 50 + 5, "replay sum includes the lost event");
}

#[tokio::test]
async fn stats_after_counter_loss_match_full_replay() {
    let pipeline = pipeline();
    let user = UserId::new(7);

    for level in [1, 2, 3] {
        pipeline
            .ingestion
            .submit(NewEvent::new(
                user,
                EventType::CompleteLevel,
                json!({"level": level}),
            ))
            .await
            .unwrap();
    }

    let drained = pipeline.drain().await;
    let before = drained.stats.get_stats(user).await.unwrap().score;

    drained.counters.wipe();
    drained.cache.invalidate(user).await.unwrap();
    let after = drained.stats.get_stats(user).await.unwrap().score;

    assert_eq!(before, 21 + 22 + 23);
    assert_eq!(before, after);
}

#[tokio::test]
async fn worker_keeps_event_store_ahead_of_counter() {
    let pipeline = pipeline();
    let user = UserId::new(8);

    // Counter store down for longer than the retry budget: the submit must
    // still succeed and the log must still hold the event.
    pipeline.counters.fail_next_calls(100);
    pipeline
        .ingestion
        .submit(NewEvent::new(user, EventType::Login, json!({})))
        .await
        .unwrap();

    let drained = pipeline.drain().await;
    assert_eq!(drained.events.len(), 1);

    // The read path heals the abandoned aggregation.
    let stats = drained.stats.get_stats(user).await.unwrap();
    assert_eq!(stats.score, 5);
}
