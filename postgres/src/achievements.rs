//! Durable achievement unlock storage.
//!
//! Unlocks are plain rows guarded by a `UNIQUE (user_id, name)` constraint.
//! `INSERT .. ON CONFLICT DO NOTHING` makes the unlock race-safe: when the
//! aggregation worker retries a delivery, or two deliveries for the same
//! user overlap, exactly one insert wins and only that caller reports a
//! fresh unlock.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use std::future::Future;
use std::pin::Pin;
use tally_core::achievement::{Achievement, AchievementStore, UnlockedAchievement};
use tally_core::event_store::PersistenceError;
use tally_core::ids::UserId;

/// PostgreSQL-backed achievement store.
#[derive(Clone)]
pub struct PostgresAchievementStore {
    pool: PgPool,
}

impl PostgresAchievementStore {
    /// Create a store over an existing connection pool (normally the same
    /// pool as the event store).
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AchievementStore for PostgresAchievementStore {
    fn unlock(
        &self,
        user_id: UserId,
        achievement: Achievement,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO achievements (user_id, name)
                VALUES ($1, $2)
                ON CONFLICT (user_id, name) DO NOTHING
                ",
            )
            .bind(user_id.as_i64())
            .bind(achievement.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            let newly_unlocked = result.rows_affected() == 1;

            if newly_unlocked {
                tracing::debug!(
                    user_id = %user_id,
                    achievement = achievement.as_str(),
                    "Achievement row created"
                );
                metrics::counter!("achievements.unlocked", "achievement" => achievement.as_str())
                    .increment(1);
            }

            Ok(newly_unlocked)
        })
    }

    fn unlocked(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<UnlockedAchievement>, PersistenceError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
                r"
                SELECT name, unlocked_at
                FROM achievements
                WHERE user_id = $1
                ORDER BY unlocked_at ASC
                ",
            )
            .bind(user_id.as_i64())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.into_iter()
                .map(|(name, unlocked_at)| {
                    Ok(UnlockedAchievement {
                        achievement: Achievement::parse(&name)?,
                        unlocked_at,
                    })
                })
                .collect()
        })
    }
}
