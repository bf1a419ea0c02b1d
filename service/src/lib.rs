//! # Tally Service
//!
//! Orchestration between the event store and the counter store: this crate
//! owns the write pipeline (ingest → persist → aggregate), the read pipeline
//! (stats with self-healing fallback), and replay-based reconciliation.
//!
//! # Write path
//!
//! ```text
//! submit ──validate──▶ EventStore::append (READ COMMITTED txn, commits first)
//!                              │
//!                              ▼
//!                     AggregationQueue (in-process, at-least-once)
//!                              │
//!                              ▼
//!        AggregationWorker ──▶ CounterStore::apply_delta (exactly-once)
//!                        └──▶ achievement unlock + stats cache invalidation
//! ```
//!
//! The ordering is the whole point: the authoritative append commits before
//! any counter work is attempted, so a crash anywhere after commit leaves
//! the event log ahead of the counter — a state replay can always repair —
//! and never the reverse.
//!
//! # Read path
//!
//! Stats reads go cache → counter → replay. A missing counter triggers a
//! reconciliation pass that recomputes the sum from the log and rebuilds
//! the counter (self-healing cache).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregation;
pub mod ingest;
pub mod reconcile;
pub mod retry;
pub mod stats;

pub use aggregation::{AggregationJob, AggregationQueue, AggregationWorker, QueueClosed};
pub use ingest::{IngestionService, SubmitError};
pub use reconcile::Reconciler;
pub use retry::RetryPolicy;
pub use stats::{StatsError, StatsService};
