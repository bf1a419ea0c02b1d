//! The aggregation queue and worker: at-least-once delivery of counter
//! updates with exactly-once effect.
//!
//! Ingestion enqueues one [`AggregationJob`] per committed event. The worker
//! applies the job's delta through [`CounterStore::apply_delta`], whose
//! per-event processed marker makes redelivery harmless — so the queue can
//! be simple and the retry loop aggressive without risking double-applied
//! points.
//!
//! A job that exhausts its retries is dropped with an error log; the event
//! itself is safe in the event store and replay-based reconciliation
//! rebuilds the counter from it.

use crate::retry::RetryPolicy;
use std::sync::Arc;
use tally_core::achievement::{Achievement, AchievementStore};
use tally_core::counter_store::{CounterStore, CounterUnavailable};
use tally_core::ids::{EventId, UserId};
use tally_core::stats::StatsCache;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of aggregation work, produced by ingestion after the event store
/// commit.
///
/// Carries the precomputed delta rather than the raw event so that retries
/// and the original attempt always apply exactly the same value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregationJob {
    /// The committed event this job aggregates.
    pub event_id: EventId,
    /// The user whose counter to update.
    pub user_id: UserId,
    /// The point delta, computed once at ingestion time.
    pub delta: i64,
    /// Achievement to unlock on the event's first aggregation, if any.
    pub achievement: Option<Achievement>,
}

/// The aggregation queue has shut down and can accept no more jobs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Aggregation queue is closed")]
pub struct QueueClosed;

/// Producer half of the aggregation queue.
///
/// Unbounded on purpose: producers must never block after the event store
/// commit, and each job is a few dozen bytes. Backpressure belongs on the
/// HTTP layer, not between commit and aggregation.
#[derive(Clone)]
pub struct AggregationQueue {
    tx: mpsc::UnboundedSender<AggregationJob>,
}

impl AggregationQueue {
    /// Create a queue, returning the producer handle and the receiver to
    /// hand to [`AggregationWorker::spawn`].
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AggregationJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a job for the worker.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the worker has shut down. Callers on the
    /// ingest path log this and move on — the event is already durable and
    /// reconciliation will pick up the delta.
    pub fn enqueue(&self, job: AggregationJob) -> Result<(), QueueClosed> {
        self.tx.send(job).map_err(|_| QueueClosed)
    }
}

/// Consumer that drains the aggregation queue.
///
/// One worker task per process is enough: the per-job work is two or three
/// store round-trips, and correctness never depends on worker count because
/// `apply_delta` is atomic and idempotent.
pub struct AggregationWorker {
    counters: Arc<dyn CounterStore>,
    achievements: Arc<dyn AchievementStore>,
    stats_cache: Arc<dyn StatsCache>,
    retry: RetryPolicy,
}

impl AggregationWorker {
    /// Create a worker over the given stores.
    #[must_use]
    pub fn new(
        counters: Arc<dyn CounterStore>,
        achievements: Arc<dyn AchievementStore>,
        stats_cache: Arc<dyn StatsCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            counters,
            achievements,
            stats_cache,
            retry,
        }
    }

    /// Spawn the worker loop onto the runtime.
    ///
    /// The task runs until every [`AggregationQueue`] producer is dropped
    /// and the channel drains, then exits; awaiting the handle is the
    /// graceful-shutdown hook.
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<AggregationJob>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    /// Drain the queue until all producers hang up.
    async fn run(self, mut rx: mpsc::UnboundedReceiver<AggregationJob>) {
        tracing::info!("Aggregation worker started");
        while let Some(job) = rx.recv().await {
            self.process(job).await;
        }
        tracing::info!("Aggregation worker stopped");
    }

    /// Apply one job, retrying transient counter failures with backoff.
    async fn process(&self, job: AggregationJob) {
        let mut attempt = 0;
        let applied = loop {
            match self
                .counters
                .apply_delta(job.user_id, job.event_id, job.delta)
                .await
            {
                Ok(outcome) => break outcome,
                Err(CounterUnavailable(reason)) if attempt < self.retry.max_retries => {
                    let delay = self.retry.jittered_delay_for_attempt(attempt);
                    attempt += 1;
                    tracing::warn!(
                        event_id = %job.event_id,
                        user_id = %job.user_id,
                        attempt = attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "Counter unavailable, backing off"
                    );
                    metrics::counter!("aggregation.retries").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(CounterUnavailable(reason)) => {
                    // The event is durable; replay-based reconciliation
                    // rebuilds the counter, so dropping the job loses
                    // nothing permanently.
                    tracing::error!(
                        event_id = %job.event_id,
                        user_id = %job.user_id,
                        delta = job.delta,
                        reason = %reason,
                        "Aggregation retries exhausted, leaving repair to reconciliation"
                    );
                    metrics::counter!("aggregation.abandoned").increment(1);
                    return;
                }
            }
        };

        if !applied.is_applied() {
            tracing::debug!(
                event_id = %job.event_id,
                "Redelivered job was already applied"
            );
            metrics::counter!("aggregation.duplicates").increment(1);
            return;
        }

        metrics::counter!("aggregation.applied").increment(1);
        tracing::debug!(
            event_id = %job.event_id,
            user_id = %job.user_id,
            delta = job.delta,
            score = applied.value(),
            "Delta aggregated"
        );

        if let Some(achievement) = job.achievement {
            self.unlock_achievement(job.user_id, achievement).await;
        }

        // Drop the cached stats blob so the next read sees the new score
        // without waiting out the TTL. Best effort: the TTL still bounds
        // staleness if this fails.
        if let Err(e) = self.stats_cache.invalidate(job.user_id).await {
            tracing::warn!(
                user_id = %job.user_id,
                error = %e,
                "Failed to invalidate stats cache"
            );
        }
    }

    /// Unlock an achievement and notify the user on first unlock.
    async fn unlock_achievement(&self, user_id: UserId, achievement: Achievement) {
        match self.achievements.unlock(user_id, achievement).await {
            Ok(true) => {
                // Notification delivery is a stand-in; a real deployment
                // would hand this to a push/email service.
                tracing::info!(
                    user_id = %user_id,
                    achievement = achievement.as_str(),
                    "[achievement] user unlocked achievement"
                );
            }
            Ok(false) => {}
            Err(e) => {
                // The unlock is insert-if-absent, so the next qualifying
                // event for this user retries it implicitly.
                tracing::warn!(
                    user_id = %user_id,
                    achievement = achievement.as_str(),
                    error = %e,
                    "Failed to record achievement unlock"
                );
            }
        }
    }
}
