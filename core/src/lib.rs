//! # Tally Core
//!
//! Core traits and domain types for the Tally event/score service.
//!
//! Tally records immutable user events in a durable event store and derives
//! per-user score aggregates from them in a fast counter store. This crate
//! defines the seams between those parts and contains no I/O of its own:
//!
//! - [`event`]: the `Event` domain model and request validation
//! - [`event_store`]: the durable, append-only event log abstraction
//! - [`counter_store`]: the atomic per-user counter abstraction
//! - [`achievement`]: achievement vocabulary and unlock storage abstraction
//! - [`scoring`]: the pure mapping from events to point deltas
//! - [`stats`]: the per-user aggregate view and its response cache
//!
//! # Architecture
//!
//! ```text
//! client → IngestionService → [EventStore::append (txn)] → [CounterStore::apply_delta]
//! client → StatsService     → [CounterStore::get] ──(absent)──→ replay + recompute
//! ```
//!
//! The event store is authoritative; the counter store is a projection that
//! can always be rebuilt by replaying a user's events. Production
//! implementations live in `tally-postgres` and `tally-redis`; deterministic
//! in-memory implementations live in `tally-testing`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod achievement;
pub mod counter_store;
pub mod event;
pub mod event_store;
pub mod ids;
pub mod scoring;
pub mod stats;

pub use achievement::{Achievement, AchievementStore, UnlockedAchievement};
pub use counter_store::{CounterStore, CounterUnavailable, DeltaOutcome};
pub use event::{EventRecord, EventType, NewEvent, ValidationError};
pub use event_store::{EventStore, PersistenceError};
pub use ids::{EventId, UserId};
pub use scoring::{ScoringPolicy, StandardScoring};
pub use stats::{ReconciliationError, StatsCache, UserStats};
