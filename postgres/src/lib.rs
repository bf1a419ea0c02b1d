//! `PostgreSQL` event store implementation for Tally.
//!
//! This crate provides the production [`EventStore`] backend plus durable
//! achievement storage. It uses sqlx with runtime-checked queries and
//! supports:
//!
//! - Append-only event persistence inside explicit READ COMMITTED
//!   transactions
//! - Streaming replay in insertion order for reconciliation
//! - Connection pooling
//! - Embedded migrations
//!
//! # Isolation level
//!
//! Appends run at READ COMMITTED, set explicitly on each transaction. The
//! workload only ever inserts new rows (no read-then-write on existing
//! data), so serializable isolation would add retry overhead without buying
//! any correctness.
//!
//! # Example
//!
//! ```no_run
//! use tally_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresEventStore::connect("postgres://localhost/tally", 10).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod achievements;

pub use achievements::PostgresAchievementStore;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::future::Future;
use std::pin::Pin;
use tally_core::event::{EventRecord, EventType, NewEvent};
use tally_core::event_store::{EventStore, PersistenceError};
use tally_core::ids::{EventId, UserId};
use uuid::Uuid;

/// Map a sqlx error onto the store's error taxonomy.
///
/// Constraint violations (unique, check, foreign key) are the caller's
/// fault and reported as such; everything else is a database failure.
pub(crate) fn map_sqlx_error(e: sqlx::Error) -> PersistenceError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation()
            || db_err.is_check_violation()
            || db_err.is_foreign_key_violation()
        {
            return PersistenceError::ConstraintViolation(db_err.to_string());
        }
    }
    PersistenceError::Database(e.to_string())
}

/// PostgreSQL-backed event store.
///
/// Cloning is cheap: the underlying [`PgPool`] is reference-counted and
/// shared process-wide.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect to the database with a bounded connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the connection fails.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| PersistenceError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded database migrations (events + achievements tables).
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if migration fails.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PersistenceError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying connection pool, for sharing with other stores.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Convert a database row to an [`EventRecord`].
    fn row_to_record(row: &PgRow) -> Result<EventRecord, PersistenceError> {
        let id: Uuid = row.try_get("id").map_err(map_sqlx_error)?;
        let sequence: i64 = row.try_get("sequence").map_err(map_sqlx_error)?;
        let user_id: i64 = row.try_get("user_id").map_err(map_sqlx_error)?;
        let event_type: String = row.try_get("event_type").map_err(map_sqlx_error)?;
        let details: serde_json::Value = row.try_get("details").map_err(map_sqlx_error)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx_error)?;

        let event_type: EventType = event_type
            .parse()
            .map_err(|e| PersistenceError::Serialization(format!("Stored event type: {e}")))?;

        Ok(EventRecord {
            id: EventId::from_uuid(id),
            sequence,
            user_id: UserId::new(user_id),
            event_type,
            details,
            created_at,
        })
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = Result<EventRecord, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let id = EventId::generate();

            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

            // READ COMMITTED is Postgres's default, but the isolation level
            // is part of this store's contract, so state it explicitly.
            sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

            let row = sqlx::query(
                r"
                INSERT INTO events (id, user_id, event_type, details)
                VALUES ($1, $2, $3, $4)
                RETURNING sequence, created_at
                ",
            )
            .bind(id.as_uuid())
            .bind(event.user_id.as_i64())
            .bind(event.event_type.as_str())
            .bind(&event.details)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            // Commit-or-rollback on all exit paths: the `?` above drops the
            // transaction, which rolls back.
            tx.commit().await.map_err(map_sqlx_error)?;

            let sequence: i64 = row.try_get("sequence").map_err(map_sqlx_error)?;
            let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx_error)?;

            tracing::debug!(
                event_id = %id,
                user_id = %event.user_id,
                event_type = %event.event_type,
                sequence = sequence,
                "Event committed"
            );

            metrics::counter!("events.appended", "event_type" => event.event_type.as_str())
                .increment(1);

            Ok(EventRecord {
                id,
                sequence,
                user_id: event.user_id,
                event_type: event.event_type,
                details: event.details,
                created_at,
            })
        })
    }

    fn replay(&self, user_id: UserId) -> BoxStream<'_, Result<EventRecord, PersistenceError>> {
        sqlx::query(
            r"
            SELECT id, sequence, user_id, event_type, details, created_at
            FROM events
            WHERE user_id = $1
            ORDER BY sequence ASC
            ",
        )
        .bind(user_id.as_i64())
        .fetch(&self.pool)
        .map_err(map_sqlx_error)
        .and_then(|row| async move { Self::row_to_record(&row) })
        .boxed()
    }

    fn recent_event_types(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as(
                r"
                SELECT event_type
                FROM events
                WHERE user_id = $1
                ORDER BY created_at DESC
                LIMIT $2
                ",
            )
            .bind(user_id.as_i64())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(rows.into_iter().map(|(event_type,)| event_type).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests with a real Postgres are in tests/integration_tests.rs.

    #[test]
    fn non_database_errors_map_to_database_variant() {
        let err = map_sqlx_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, PersistenceError::Database(_)));
    }
}
