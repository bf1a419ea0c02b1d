//! Counter store trait: low-latency atomic per-user score counters.
//!
//! The counter store holds the derived score totals. It is a cache in the
//! strict sense: the event store remains authoritative, and every value here
//! must be reproducible by replaying a user's events. What the counter store
//! adds is an *atomic increment primitive* — the load-bearing correctness
//! property that lets arbitrarily many concurrent writers update the same
//! user's score without a read-modify-write race and without any
//! application-level lock.
//!
//! # Implementations
//!
//! - `RedisCounterStore` (in `tally-redis`): production implementation on
//!   `INCRBY` plus a Lua script for exactly-once delta application
//! - `InMemoryCounterStore` (in `tally-testing`): deterministic testing

use crate::ids::{EventId, UserId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// The counter store could not be reached.
///
/// Always recoverable: the authoritative event log is unaffected, so callers
/// retry with backoff or fall back to replay. This error is never surfaced
/// as a failure of an operation whose event store write already committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Counter store unavailable: {0}")]
pub struct CounterUnavailable(pub String);

/// Result of an idempotent delta application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// The delta was applied now; carries the resulting counter value.
    Applied(i64),
    /// This event's delta had already been applied by an earlier attempt;
    /// carries the current (unchanged) counter value.
    AlreadyApplied(i64),
}

impl DeltaOutcome {
    /// The counter value after the call, regardless of outcome.
    #[must_use]
    pub const fn value(&self) -> i64 {
        match self {
            Self::Applied(v) | Self::AlreadyApplied(v) => *v,
        }
    }

    /// Whether this call changed the counter.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Atomic per-user counters.
///
/// # Atomicity contract
///
/// `increment` and `apply_delta` must be atomic with respect to arbitrary
/// concurrent callers for the same key: the final value after N concurrent
/// calls is the sum of all applied deltas, independent of interleaving.
/// Implementations achieve this with a native primitive (Redis `INCRBY`),
/// not an external lock.
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` (which may be negative) to the user's counter,
    /// creating it at 0 if absent. Returns the resulting value.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] on connectivity loss; retry with
    /// backoff.
    fn increment(
        &self,
        user_id: UserId,
        delta: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterUnavailable>> + Send + '_>>;

    /// Atomically apply an event's delta exactly once.
    ///
    /// A per-event processed marker is checked and set in the same atomic
    /// step as the increment, so retrying a delivery (the aggregation queue
    /// is at-least-once) can never double-apply a delta.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] on connectivity loss. The caller must
    /// assume nothing about whether the delta landed and simply retry: the
    /// marker makes the retry safe.
    fn apply_delta(
        &self,
        user_id: UserId,
        event_id: EventId,
        delta: i64,
    ) -> Pin<Box<dyn Future<Output = Result<DeltaOutcome, CounterUnavailable>> + Send + '_>>;

    /// Read the current counter value.
    ///
    /// `None` means no delta has ever been applied for this user — distinct
    /// from `Some(0)`, which means deltas were applied and net to zero.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] on connectivity loss.
    fn get(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, CounterUnavailable>> + Send + '_>>;

    /// Overwrite the counter with an authoritative replayed value and
    /// restore the processed markers of the events that compose it.
    ///
    /// Used by reconciliation after recomputing the sum from the event log;
    /// never used on the ingest path. Restoring the markers in the same
    /// atomic step as the counter is what keeps a still-queued aggregation
    /// job for an already-replayed event from double-applying its delta
    /// after the rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] on connectivity loss.
    fn rebuild(
        &self,
        user_id: UserId,
        value: i64,
        applied: Vec<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>>;
}
