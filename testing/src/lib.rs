//! # Tally Testing
//!
//! In-memory implementations of every store trait in `tally-core`, for
//! fast, deterministic tests that never touch Postgres or Redis.
//!
//! Each mock honors the same contract as its production counterpart —
//! atomic counter updates, exactly-once delta application, insertion-order
//! replay — and adds failure injection so retry and reconciliation paths
//! can be exercised:
//!
//! ```
//! use tally_testing::mocks::InMemoryCounterStore;
//!
//! let counters = InMemoryCounterStore::new();
//! counters.fail_next_calls(2); // next two calls report CounterUnavailable
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Mock store implementations.
pub mod mocks {
    use chrono::Utc;
    use futures::stream::BoxStream;
    use std::collections::{HashMap, HashSet};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tally_core::achievement::{Achievement, AchievementStore, UnlockedAchievement};
    use tally_core::counter_store::{CounterStore, CounterUnavailable, DeltaOutcome};
    use tally_core::event::{EventRecord, NewEvent};
    use tally_core::event_store::{EventStore, PersistenceError};
    use tally_core::ids::{EventId, UserId};
    use tally_core::stats::{StatsCache, UserStats};

    /// Lock a mutex, recovering from poisoning.
    ///
    /// Test doubles hold locks only for plain data manipulation, so a
    /// poisoned lock just means a test thread panicked mid-assertion; the
    /// data is still usable for the remaining assertions.
    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// In-memory append-only event store.
    ///
    /// Mirrors the production store's contract: global monotonically
    /// increasing sequence numbers, per-user insertion-order replay, and a
    /// positive-user-id constraint.
    #[derive(Default)]
    pub struct InMemoryEventStore {
        events: Mutex<Vec<EventRecord>>,
        fail_calls: AtomicUsize,
    }

    impl InMemoryEventStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` operations fail with a database error.
        pub fn fail_next_calls(&self, n: usize) {
            self.fail_calls.store(n, Ordering::SeqCst);
        }

        /// Number of committed events across all users.
        #[must_use]
        pub fn len(&self) -> usize {
            lock(&self.events).len()
        }

        /// Whether the log is empty.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        fn check_injected_failure(&self) -> Result<(), PersistenceError> {
            if self
                .fail_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PersistenceError::Database(
                    "injected event store failure".to_string(),
                ));
            }
            Ok(())
        }
    }

    impl EventStore for InMemoryEventStore {
        fn append(
            &self,
            event: NewEvent,
        ) -> Pin<Box<dyn Future<Output = Result<EventRecord, PersistenceError>> + Send + '_>>
        {
            Box::pin(async move {
                self.check_injected_failure()?;

                if event.user_id.as_i64() <= 0 {
                    return Err(PersistenceError::ConstraintViolation(format!(
                        "user_id must be positive, got {}",
                        event.user_id
                    )));
                }

                let mut events = lock(&self.events);
                #[allow(clippy::cast_possible_wrap)] // Test logs stay far below i64::MAX
                let sequence = events.len() as i64 + 1;
                let record = EventRecord {
                    id: EventId::generate(),
                    sequence,
                    user_id: event.user_id,
                    event_type: event.event_type,
                    details: event.details,
                    created_at: Utc::now(),
                };
                events.push(record.clone());
                Ok(record)
            })
        }

        fn replay(&self, user_id: UserId) -> BoxStream<'_, Result<EventRecord, PersistenceError>> {
            let failure = self.check_injected_failure();
            let records: Vec<Result<EventRecord, PersistenceError>> = match failure {
                Err(e) => vec![Err(e)],
                Ok(()) => lock(&self.events)
                    .iter()
                    .filter(|e| e.user_id == user_id)
                    .cloned()
                    .map(Ok)
                    .collect(),
            };
            Box::pin(futures::stream::iter(records))
        }

        fn recent_event_types(
            &self,
            user_id: UserId,
            limit: u32,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, PersistenceError>> + Send + '_>>
        {
            Box::pin(async move {
                self.check_injected_failure()?;
                Ok(lock(&self.events)
                    .iter()
                    .rev()
                    .filter(|e| e.user_id == user_id)
                    .take(limit as usize)
                    .map(|e| e.event_type.as_str().to_string())
                    .collect())
            })
        }
    }

    #[derive(Default)]
    struct CounterState {
        counters: HashMap<UserId, i64>,
        applied: HashSet<EventId>,
    }

    /// In-memory atomic counter store with exactly-once delta application.
    ///
    /// A single lock around counters and markers gives the same atomicity
    /// the production Lua script provides.
    #[derive(Default)]
    pub struct InMemoryCounterStore {
        state: Mutex<CounterState>,
        fail_calls: AtomicUsize,
    }

    impl InMemoryCounterStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` operations fail with [`CounterUnavailable`].
        pub fn fail_next_calls(&self, n: usize) {
            self.fail_calls.store(n, Ordering::SeqCst);
        }

        /// Simulate a full counter store loss (flushed Redis): counters and
        /// processed markers vanish together.
        pub fn wipe(&self) {
            let mut state = lock(&self.state);
            state.counters.clear();
            state.applied.clear();
        }

        /// Whether an event's delta has been applied.
        #[must_use]
        pub fn is_applied(&self, event_id: EventId) -> bool {
            lock(&self.state).applied.contains(&event_id)
        }

        fn check_injected_failure(&self) -> Result<(), CounterUnavailable> {
            if self
                .fail_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CounterUnavailable(
                    "injected counter store failure".to_string(),
                ));
            }
            Ok(())
        }
    }

    impl CounterStore for InMemoryCounterStore {
        fn increment(
            &self,
            user_id: UserId,
            delta: i64,
        ) -> Pin<Box<dyn Future<Output = Result<i64, CounterUnavailable>> + Send + '_>> {
            Box::pin(async move {
                self.check_injected_failure()?;
                let mut state = lock(&self.state);
                let value = state.counters.entry(user_id).or_insert(0);
                *value += delta;
                Ok(*value)
            })
        }

        fn apply_delta(
            &self,
            user_id: UserId,
            event_id: EventId,
            delta: i64,
        ) -> Pin<Box<dyn Future<Output = Result<DeltaOutcome, CounterUnavailable>> + Send + '_>>
        {
            Box::pin(async move {
                self.check_injected_failure()?;
                let mut state = lock(&self.state);
                if state.applied.insert(event_id) {
                    let value = state.counters.entry(user_id).or_insert(0);
                    *value += delta;
                    Ok(DeltaOutcome::Applied(*value))
                } else {
                    Ok(DeltaOutcome::AlreadyApplied(
                        state.counters.get(&user_id).copied().unwrap_or(0),
                    ))
                }
            })
        }

        fn get(
            &self,
            user_id: UserId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, CounterUnavailable>> + Send + '_>>
        {
            Box::pin(async move {
                self.check_injected_failure()?;
                Ok(lock(&self.state).counters.get(&user_id).copied())
            })
        }

        fn rebuild(
            &self,
            user_id: UserId,
            value: i64,
            applied: Vec<EventId>,
        ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>> {
            Box::pin(async move {
                self.check_injected_failure()?;
                let mut state = lock(&self.state);
                state.counters.insert(user_id, value);
                state.applied.extend(applied);
                Ok(())
            })
        }
    }

    /// In-memory achievement store.
    #[derive(Default)]
    pub struct InMemoryAchievementStore {
        unlocks: Mutex<HashMap<UserId, Vec<UnlockedAchievement>>>,
    }

    impl InMemoryAchievementStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl AchievementStore for InMemoryAchievementStore {
        fn unlock(
            &self,
            user_id: UserId,
            achievement: Achievement,
        ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
            Box::pin(async move {
                let mut unlocks = lock(&self.unlocks);
                let entries = unlocks.entry(user_id).or_default();
                if entries.iter().any(|u| u.achievement == achievement) {
                    return Ok(false);
                }
                entries.push(UnlockedAchievement {
                    achievement,
                    unlocked_at: Utc::now(),
                });
                Ok(true)
            })
        }

        fn unlocked(
            &self,
            user_id: UserId,
        ) -> Pin<
            Box<dyn Future<Output = Result<Vec<UnlockedAchievement>, PersistenceError>> + Send + '_>,
        > {
            Box::pin(async move {
                Ok(lock(&self.unlocks)
                    .get(&user_id)
                    .cloned()
                    .unwrap_or_default())
            })
        }
    }

    /// In-memory stats response cache.
    ///
    /// TTLs are accepted but not enforced; tests drive expiry explicitly
    /// through [`StatsCache::invalidate`].
    #[derive(Default)]
    pub struct InMemoryStatsCache {
        entries: Mutex<HashMap<UserId, UserStats>>,
    }

    impl InMemoryStatsCache {
        /// Create an empty cache.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of cached entries.
        #[must_use]
        pub fn len(&self) -> usize {
            lock(&self.entries).len()
        }

        /// Whether the cache is empty.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl StatsCache for InMemoryStatsCache {
        fn get(
            &self,
            user_id: UserId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<UserStats>, CounterUnavailable>> + Send + '_>>
        {
            Box::pin(async move { Ok(lock(&self.entries).get(&user_id).cloned()) })
        }

        fn put(
            &self,
            stats: &UserStats,
            _ttl: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>> {
            let stats = stats.clone();
            Box::pin(async move {
                lock(&self.entries).insert(stats.user_id, stats);
                Ok(())
            })
        }

        fn invalidate(
            &self,
            user_id: UserId,
        ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>> {
            Box::pin(async move {
                lock(&self.entries).remove(&user_id);
                Ok(())
            })
        }
    }
}

pub use mocks::{
    InMemoryAchievementStore, InMemoryCounterStore, InMemoryEventStore, InMemoryStatsCache,
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use tally_core::counter_store::CounterStore;
    use tally_core::event::{EventType, NewEvent};
    use tally_core::event_store::EventStore;
    use tally_core::ids::{EventId, UserId};

    #[tokio::test]
    async fn event_store_assigns_increasing_sequences() {
        let store = InMemoryEventStore::new();
        let user = UserId::new(1);

        let first = store
            .append(NewEvent::new(user, EventType::Login, json!({})))
            .await
            .unwrap();
        let second = store
            .append(NewEvent::new(user, EventType::FindSecret, json!({})))
            .await
            .unwrap();

        assert!(second.sequence > first.sequence);

        let replayed: Vec<_> = store.replay(user).try_collect().await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, first.id);
    }

    #[tokio::test]
    async fn counter_apply_delta_is_exactly_once() {
        let counters = InMemoryCounterStore::new();
        let user = UserId::new(1);
        let event_id = EventId::generate();

        let first = counters.apply_delta(user, event_id, 10).await.unwrap();
        let second = counters.apply_delta(user, event_id, 10).await.unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(counters.get(user).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let counters = InMemoryCounterStore::new();
        counters.fail_next_calls(1);

        assert!(counters.get(UserId::new(1)).await.is_err());
        assert!(counters.get(UserId::new(1)).await.is_ok());
    }

    #[tokio::test]
    async fn wipe_clears_counters_and_markers_together() {
        let counters = InMemoryCounterStore::new();
        let user = UserId::new(1);
        let event_id = EventId::generate();

        counters.apply_delta(user, event_id, 10).await.unwrap();
        counters.wipe();

        assert_eq!(counters.get(user).await.unwrap(), None);
        assert!(!counters.is_applied(event_id));
    }
}
