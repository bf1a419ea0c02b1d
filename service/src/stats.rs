//! Stats query service: assemble the per-user aggregate view.
//!
//! Reads follow cache → counter → replay:
//!
//! 1. A cached response (TTL'd JSON blob) short-circuits everything.
//! 2. Otherwise the score comes from the counter store.
//! 3. A missing counter triggers reconciliation: recompute from the event
//!    log and rebuild the counter on the way out (self-healing cache).
//!
//! The response is not linearizable with an in-flight `submit` — the
//! eventual-consistency window is bounded by the aggregation worker's
//! processing latency plus, when cache invalidation fails, the cache TTL.

use crate::reconcile::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tally_core::achievement::AchievementStore;
use tally_core::counter_store::CounterStore;
use tally_core::event_store::{EventStore, PersistenceError};
use tally_core::ids::UserId;
use tally_core::stats::{ReconciliationError, StatsCache, UserStats};
use thiserror::Error;

/// Number of recent event type tags included in the response.
const RECENT_EVENTS_LIMIT: u32 = 5;

/// Failure of a stats read.
///
/// Either way this is a degraded read: nothing was lost, and a later read
/// retries the same recovery.
#[derive(Error, Debug)]
pub enum StatsError {
    /// The counter was missing and replay-based recomputation failed.
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    /// Reading recent events or achievements failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Read side of tally: serves the per-user aggregate view.
#[derive(Clone)]
pub struct StatsService {
    events: Arc<dyn EventStore>,
    counters: Arc<dyn CounterStore>,
    achievements: Arc<dyn AchievementStore>,
    cache: Arc<dyn StatsCache>,
    reconciler: Reconciler,
    cache_ttl: Duration,
}

impl StatsService {
    /// Create a stats service over the given stores.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        counters: Arc<dyn CounterStore>,
        achievements: Arc<dyn AchievementStore>,
        cache: Arc<dyn StatsCache>,
        reconciler: Reconciler,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            events,
            counters,
            achievements,
            cache,
            reconciler,
            cache_ttl,
        }
    }

    /// The current aggregate for a user.
    ///
    /// A user with no events gets a zero score and empty lists rather than
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError`] when neither the counter nor replay could
    /// produce a score, or when the event/achievement reads fail. The
    /// response cache is never a source of errors: cache failures are
    /// logged and treated as misses.
    pub async fn get_stats(&self, user_id: UserId) -> Result<UserStats, StatsError> {
        match self.cache.get(user_id).await {
            Ok(Some(stats)) => {
                metrics::counter!("stats.cache_hits").increment(1);
                return Ok(stats);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Stats cache read failed");
            }
        }
        metrics::counter!("stats.cache_misses").increment(1);

        let score = self.resolve_score(user_id).await?;

        let recent_events = self
            .events
            .recent_event_types(user_id, RECENT_EVENTS_LIMIT)
            .await?;

        let achievements = self
            .achievements
            .unlocked(user_id)
            .await?
            .into_iter()
            .map(|u| u.achievement.as_str().to_string())
            .collect();

        let stats = UserStats {
            user_id,
            score,
            recent_events,
            achievements,
        };

        if let Err(e) = self.cache.put(&stats, self.cache_ttl).await {
            tracing::warn!(user_id = %user_id, error = %e, "Stats cache write failed");
        }

        Ok(stats)
    }

    /// Resolve the score, healing a missing counter by replay.
    async fn resolve_score(&self, user_id: UserId) -> Result<i64, StatsError> {
        match self.counters.get(user_id).await {
            Ok(Some(score)) => Ok(score),
            Ok(None) => {
                tracing::info!(user_id = %user_id, "Counter absent, reconciling from event log");
                Ok(self.reconciler.reconcile_user(user_id).await?)
            }
            Err(e) => {
                // Counter store down entirely: serve from the log without
                // trying to rebuild (that write would fail too).
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Counter store unavailable, serving score from replay"
                );
                let (sum, _) = self
                    .reconciler
                    .replay_sum(user_id)
                    .await
                    .map_err(ReconciliationError::Replay)?;
                Ok(sum)
            }
        }
    }
}
