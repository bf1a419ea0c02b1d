//! Event store trait: the durable, append-only log of user events.
//!
//! The event store is the single source of truth in tally. Counters and
//! every other derived view must be reconstructible from it alone, which is
//! why [`EventStore::replay`] exists even though it is never on the hot path.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `tally-postgres`): production implementation
//! - `InMemoryEventStore` (in `tally-testing`): fast, deterministic testing
//!
//! # Dyn compatibility
//!
//! The trait uses explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so services can hold an `Arc<dyn EventStore>` without being
//! generic over the backend.

use crate::event::{EventRecord, NewEvent};
use crate::ids::UserId;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by the event store.
///
/// An `append` that returns an error has not committed anything: the
/// transaction wrapping the write either commits fully or rolls back, so
/// callers never need to reason about partially-written events.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// A database constraint rejected the write (e.g. an invalid reference).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The database could not be reached or the query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable, transactional persistence of events.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; a single instance is shared across
/// all request handlers and the aggregation worker.
///
/// # Transaction contract
///
/// `append` runs inside a READ COMMITTED transaction. The workload is
/// append-only (no read-then-write on existing rows), so stricter isolation
/// buys nothing here; what matters is atomicity of the single insert and
/// that the row is visible to other connections only after commit.
pub trait EventStore: Send + Sync {
    /// Persist a validated event, assigning its id and timestamp.
    ///
    /// The returned record is the committed row. Callers may rely on the
    /// commit having happened before any aggregation is attempted, so a
    /// crash after `append` returns leaves the authoritative log ahead of
    /// the counter cache, never behind it.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::ConstraintViolation`]: the write was rejected
    /// - [`PersistenceError::Database`]: connection loss or query failure
    ///
    /// In both cases nothing was committed.
    fn append(
        &self,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = Result<EventRecord, PersistenceError>> + Send + '_>>;

    /// Stream all events for a user in insertion order.
    ///
    /// The stream is finite and restartable: calling `replay` again over the
    /// same committed state yields the same records in the same order. Used
    /// by reconciliation, never by the ingest hot path.
    fn replay(&self, user_id: UserId) -> BoxStream<'_, Result<EventRecord, PersistenceError>>;

    /// The most recent event type tags for a user, newest first.
    ///
    /// Feeds the "recent activity" portion of the stats response.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the query fails.
    fn recent_event_types(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, PersistenceError>> + Send + '_>>;
}
