//! Redis counter store and stats cache for Tally.
//!
//! This crate provides the production [`CounterStore`] backend. Per-user
//! scores live under `user:{user_id}:score` and are updated with Redis's
//! native `INCRBY` — the atomic-increment primitive that makes concurrent
//! score updates race-free without any application-level locking.
//!
//! # Exactly-once delta application
//!
//! The aggregation queue delivers at-least-once, so the store must make
//! re-delivery harmless. [`RedisCounterStore::apply_delta`] runs a Lua
//! script that checks-and-sets a per-event processed marker
//! (`event:{event_id}:applied`) and performs the `INCRBY` in one atomic
//! step. The marker lives in the same Redis as the counter, so the two can
//! only be lost together — and replay from the event store rebuilds both.
//!
//! # Example
//!
//! ```no_run
//! use tally_redis::RedisCounterStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisCounterStore::new("redis://127.0.0.1:6379").await?;
//! let cache = store.stats_cache();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tally_core::counter_store::{CounterStore, CounterUnavailable, DeltaOutcome};
use tally_core::ids::{EventId, UserId};
use tally_core::stats::{StatsCache, UserStats};

/// How long processed-event markers are kept.
///
/// Must comfortably exceed the aggregation worker's retry window (seconds to
/// minutes); 24 hours keeps marker growth bounded without ever racing a
/// live retry.
const APPLIED_MARKER_TTL_SECS: u64 = 86_400;

/// Atomic check-marker-and-increment. `KEYS[1]` is the per-event marker,
/// `KEYS[2]` the user's score; `ARGV[1]` the delta, `ARGV[2]` the marker
/// TTL. Returns `{applied_flag, counter_value}`.
const APPLY_DELTA_SCRIPT: &str = r"
    if redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[2]) then
        return {1, redis.call('INCRBY', KEYS[2], ARGV[1])}
    end
    return {0, tonumber(redis.call('GET', KEYS[2]) or '0')}
";

fn unavailable(e: &redis::RedisError) -> CounterUnavailable {
    CounterUnavailable(e.to_string())
}

/// Redis-backed atomic counter store.
///
/// Connection pooling is handled by [`ConnectionManager`], which also
/// reconnects transparently; cloning the store is cheap.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn_manager: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnavailable`] if the connection cannot be
    /// established.
    pub async fn new(redis_url: &str) -> Result<Self, CounterUnavailable> {
        let client = Client::open(redis_url)
            .map_err(|e| CounterUnavailable(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CounterUnavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self { conn_manager })
    }

    /// A stats response cache sharing this store's connection.
    #[must_use]
    pub fn stats_cache(&self) -> RedisStatsCache {
        RedisStatsCache {
            conn_manager: self.conn_manager.clone(),
        }
    }

    /// The Redis key for a user's score counter.
    fn score_key(user_id: UserId) -> String {
        format!("user:{user_id}:score")
    }

    /// The Redis key for an event's processed marker.
    fn applied_key(event_id: EventId) -> String {
        format!("event:{event_id}:applied")
    }
}

impl CounterStore for RedisCounterStore {
    fn increment(
        &self,
        user_id: UserId,
        delta: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterUnavailable>> + Send + '_>> {
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let value: i64 = conn
                .incr(Self::score_key(user_id), delta)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(value)
        })
    }

    fn apply_delta(
        &self,
        user_id: UserId,
        event_id: EventId,
        delta: i64,
    ) -> Pin<Box<dyn Future<Output = Result<DeltaOutcome, CounterUnavailable>> + Send + '_>> {
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let script = Script::new(APPLY_DELTA_SCRIPT);
            let (applied, value): (i64, i64) = script
                .key(Self::applied_key(event_id))
                .key(Self::score_key(user_id))
                .arg(delta)
                .arg(APPLIED_MARKER_TTL_SECS)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;

            if applied == 1 {
                tracing::debug!(
                    user_id = %user_id,
                    event_id = %event_id,
                    delta = delta,
                    value = value,
                    "Delta applied"
                );
                Ok(DeltaOutcome::Applied(value))
            } else {
                tracing::debug!(
                    user_id = %user_id,
                    event_id = %event_id,
                    "Delta already applied, skipping"
                );
                Ok(DeltaOutcome::AlreadyApplied(value))
            }
        })
    }

    fn get(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, CounterUnavailable>> + Send + '_>> {
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let value: Option<i64> = conn
                .get(Self::score_key(user_id))
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(value)
        })
    }

    fn rebuild(
        &self,
        user_id: UserId,
        value: i64,
        applied: Vec<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>> {
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            // Counter and markers must move together: a MULTI/EXEC pipeline
            // makes the rebuild atomic, so a concurrent apply_delta sees
            // either the pre-rebuild or the post-rebuild world, never a
            // counter without its markers.
            let mut pipe = redis::pipe();
            pipe.atomic().set(Self::score_key(user_id), value).ignore();
            for event_id in &applied {
                pipe.set_ex(Self::applied_key(*event_id), 1, APPLIED_MARKER_TTL_SECS)
                    .ignore();
            }

            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;

            tracing::info!(
                user_id = %user_id,
                value = value,
                events = applied.len(),
                "Counter rebuilt from replay"
            );
            Ok(())
        })
    }
}

/// TTL-based cache of assembled stats responses, stored as JSON blobs under
/// `user:{user_id}:stats`.
#[derive(Clone)]
pub struct RedisStatsCache {
    conn_manager: ConnectionManager,
}

impl RedisStatsCache {
    /// The Redis key for a user's cached stats response.
    fn stats_key(user_id: UserId) -> String {
        format!("user:{user_id}:stats")
    }
}

impl StatsCache for RedisStatsCache {
    fn get(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserStats>, CounterUnavailable>> + Send + '_>>
    {
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let raw: Option<String> = conn
                .get(Self::stats_key(user_id))
                .await
                .map_err(|e| unavailable(&e))?;

            let Some(raw) = raw else {
                return Ok(None);
            };

            // A blob we can no longer decode is a miss, not an error; it
            // will be overwritten by the next put.
            match serde_json::from_str::<UserStats>(&raw) {
                Ok(stats) => Ok(Some(stats)),
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Discarding undecodable cached stats"
                    );
                    Ok(None)
                }
            }
        })
    }

    fn put(
        &self,
        stats: &UserStats,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>> {
        let mut conn = self.conn_manager.clone();
        let key = Self::stats_key(stats.user_id);
        let payload = serde_json::to_string(stats);
        Box::pin(async move {
            let payload =
                payload.map_err(|e| CounterUnavailable(format!("Failed to encode stats: {e}")))?;

            let _: () = conn
                .set_ex(&key, payload, ttl.as_secs())
                .await
                .map_err(|e| unavailable(&e))?;

            tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached stats response");
            Ok(())
        })
    }

    fn invalidate(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CounterUnavailable>> + Send + '_>> {
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let _: () = conn
                .del(Self::stats_key(user_id))
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    const TEST_URL: &str = "redis://127.0.0.1:6379";

    #[test]
    fn keys_are_namespaced_per_user_and_event() {
        assert_eq!(RedisCounterStore::score_key(UserId::new(5)), "user:5:score");
        assert_eq!(RedisStatsCache::stats_key(UserId::new(5)), "user:5:stats");
        let event_id = EventId::generate();
        assert_eq!(
            RedisCounterStore::applied_key(event_id),
            format!("event:{event_id}:applied")
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn increment_creates_at_zero_and_accumulates() {
        let store = RedisCounterStore::new(TEST_URL).await.unwrap();
        let user = UserId::new(910_001);

        let first = store.increment(user, 10).await.unwrap();
        let second = store.increment(user, 5).await.unwrap();
        assert_eq!(second, first + 5);

        // Negative deltas are allowed.
        let third = store.increment(user, -3).await.unwrap();
        assert_eq!(third, second - 3);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn get_distinguishes_absent_from_zero() {
        let store = RedisCounterStore::new(TEST_URL).await.unwrap();
        let user = UserId::new(910_002);

        assert_eq!(store.get(user).await.unwrap(), None);

        store.increment(user, 5).await.unwrap();
        store.increment(user, -5).await.unwrap();
        assert_eq!(store.get(user).await.unwrap(), Some(0));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn apply_delta_is_exactly_once() {
        let store = RedisCounterStore::new(TEST_URL).await.unwrap();
        let user = UserId::new(910_003);
        let event_id = EventId::generate();

        let before = store.get(user).await.unwrap().unwrap_or(0);

        let first = store.apply_delta(user, event_id, 25).await.unwrap();
        assert!(first.is_applied());
        assert_eq!(first.value(), before + 25);

        // Re-delivery of the same event must not move the counter.
        let second = store.apply_delta(user, event_id, 25).await.unwrap();
        assert!(!second.is_applied());
        assert_eq!(second.value(), before + 25);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn concurrent_apply_delta_sums_all_events() {
        let store = RedisCounterStore::new(TEST_URL).await.unwrap();
        let user = UserId::new(910_004);
        let before = store.get(user).await.unwrap().unwrap_or(0);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let event_id = EventId::generate();
            tasks.push(tokio::spawn(async move {
                store.apply_delta(user, event_id, 7).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.get(user).await.unwrap(), Some(before + 20 * 7));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn stats_cache_roundtrip_and_invalidate() {
        let store = RedisCounterStore::new(TEST_URL).await.unwrap();
        let cache = store.stats_cache();
        let user = UserId::new(910_005);

        let stats = UserStats {
            user_id: user,
            score: 70,
            recent_events: vec!["complete_level".to_string()],
            achievements: vec!["Master".to_string()],
        };

        cache.put(&stats, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(user).await.unwrap(), Some(stats));

        cache.invalidate(user).await.unwrap();
        assert_eq!(cache.get(user).await.unwrap(), None);
    }
}
