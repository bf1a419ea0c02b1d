//! Identifier types for events and users.
//!
//! Strong newtypes keep the two integer/uuid id spaces from being mixed up
//! in function signatures and give each a stable wire representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for [`EventId`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid event ID: {0}")]
pub struct ParseEventIdError(String);

/// Opaque identifier of a committed event.
///
/// Assigned by the ingestion path at write time; stable and unique for the
/// lifetime of the event log. Backed by a UUIDv4 so identifiers can be
/// generated without coordination.
///
/// # Examples
///
/// ```
/// use tally_core::ids::EventId;
///
/// let id = EventId::generate();
/// let parsed: EventId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. one read back from storage).
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseEventIdError(e.to_string()))
    }
}

/// Identifier of the user an event belongs to.
///
/// User accounts themselves are managed elsewhere; tally only needs a stable
/// integer reference to partition the event log and the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Create a user id from a raw integer.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw integer value.
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
