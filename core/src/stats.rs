//! Per-user aggregate view and its response cache.
//!
//! [`UserStats`] is the read-side projection handed to clients: the current
//! score plus a little recent-activity context. It is assembled by the stats
//! query service and cached whole, with a TTL, in the same store that holds
//! the counters.

use crate::counter_store::CounterUnavailable;
use crate::event_store::PersistenceError;
use crate::ids::UserId;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Replay-based recomputation of an aggregate failed.
///
/// Raised only on the read path, when the counter was missing and the
/// fallback recomputation could not complete. No data is lost: the event
/// store is untouched and a later read can retry the reconciliation.
#[derive(Error, Debug)]
pub enum ReconciliationError {
    /// Replaying the user's events failed.
    #[error("Replay failed: {0}")]
    Replay(#[from] PersistenceError),

    /// The recomputed value could not be written back to the counter store.
    #[error("Counter repopulation failed: {0}")]
    Counter(#[from] CounterUnavailable),
}

/// The per-user aggregate returned by the stats endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    /// The user this aggregate describes.
    pub user_id: UserId,
    /// Current score: the sum of point deltas of all committed events.
    pub score: i64,
    /// Most recent event type tags, newest first (at most five).
    pub recent_events: Vec<String>,
    /// Names of unlocked achievements, oldest first.
    pub achievements: Vec<String>,
}

/// TTL-based cache of assembled [`UserStats`] responses.
///
/// Strictly an optimization: every error on this interface is treated as a
/// cache miss by the read path and never surfaced to clients. The
/// aggregation worker invalidates a user's entry after applying a delta so
/// reads converge faster than TTL expiry.
pub trait StatsCache: Send + Sync {
    /// Look up a cached response.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] on connectivity loss; callers treat
    /// this as a miss.
    fn get(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserStats>, CounterUnavailable>> + Send + '_>>;

    /// Store a response for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] on connectivity loss; callers log and
    /// continue.
    fn put(
        &self,
        stats: &UserStats,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>>;

    /// Drop a user's cached response, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] on connectivity loss; callers log and
    /// continue (the entry still expires by TTL).
    fn invalidate(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>>;
}
