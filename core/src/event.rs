//! Event domain model and request validation.
//!
//! Events are immutable facts about something a user did. Once committed to
//! the event store they are never mutated or deleted; every aggregate in the
//! system must be derivable from them alone.

use crate::ids::{EventId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while validating an incoming event, before anything is
/// persisted.
///
/// These map to a 4xx response at the HTTP boundary; a rejected event leaves
/// no trace in any store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The event type tag is not part of the known vocabulary.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The user id is not a plausible user reference.
    #[error("Invalid user id: {0}")]
    InvalidUserId(i64),

    /// The details payload is not a JSON object.
    #[error("Event details must be a JSON object")]
    DetailsNotAnObject,

    /// A field required by this event type is missing from the details.
    #[error("Missing required detail field: {0}")]
    MissingDetail(&'static str),

    /// A detail field is present but has the wrong type or an out-of-range
    /// value.
    #[error("Invalid detail field {field}: {reason}")]
    InvalidDetail {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable description of what was wrong.
        reason: String,
    },
}

/// The closed vocabulary of event types tally understands.
///
/// The wire representation is the lowercase snake_case tag (`"login"`,
/// `"complete_level"`, `"find_secret"`); unknown tags are rejected at
/// validation time rather than stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The user signed in.
    Login,
    /// The user finished a level; `details.level` carries which one.
    CompleteLevel,
    /// The user found a hidden secret.
    FindSecret,
}

impl EventType {
    /// The stable string tag stored in the event log.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::CompleteLevel => "complete_level",
            Self::FindSecret => "find_secret",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(Self::Login),
            "complete_level" => Ok(Self::CompleteLevel),
            "find_secret" => Ok(Self::FindSecret),
            other => Err(ValidationError::UnknownEventType(other.to_string())),
        }
    }
}

/// An event as submitted by a client, before the store has assigned identity.
///
/// `id` and `created_at` are deliberately absent: both are assigned at
/// persistence time by [`crate::event_store::EventStore::append`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// The user the event belongs to.
    pub user_id: UserId,
    /// What happened.
    pub event_type: EventType,
    /// Type-specific payload, e.g. `{"level": 30}` for `complete_level`.
    pub details: serde_json::Value,
}

impl NewEvent {
    /// Create a new unvalidated event.
    #[must_use]
    pub const fn new(user_id: UserId, event_type: EventType, details: serde_json::Value) -> Self {
        Self {
            user_id,
            event_type,
            details,
        }
    }

    /// Validate the event's shape.
    ///
    /// Checks that the user id is positive, that `details` is a JSON object,
    /// and that type-specific required fields are present and in range
    /// (`complete_level` requires an integer `level >= 1`).
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.as_i64() <= 0 {
            return Err(ValidationError::InvalidUserId(self.user_id.as_i64()));
        }

        let Some(details) = self.details.as_object() else {
            return Err(ValidationError::DetailsNotAnObject);
        };

        if self.event_type == EventType::CompleteLevel {
            let level = details
                .get("level")
                .ok_or(ValidationError::MissingDetail("level"))?;
            match level.as_i64() {
                Some(level) if level >= 1 => {}
                Some(level) => {
                    return Err(ValidationError::InvalidDetail {
                        field: "level",
                        reason: format!("must be >= 1, got {level}"),
                    });
                }
                None => {
                    return Err(ValidationError::InvalidDetail {
                        field: "level",
                        reason: format!("must be an integer, got {level}"),
                    });
                }
            }
        }

        Ok(())
    }
}

/// A committed event read back from the event store.
///
/// # Invariants
///
/// - `id` is unique and stable for the lifetime of the log.
/// - `sequence` is strictly increasing in commit order and is what
///   [`crate::event_store::EventStore::replay`] orders by.
/// - The record never changes after commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Opaque identifier assigned at write time.
    pub id: EventId,
    /// Global insertion-order position, assigned by the store.
    pub sequence: i64,
    /// The user the event belongs to.
    pub user_id: UserId,
    /// What happened.
    pub event_type: EventType,
    /// Type-specific payload as stored.
    pub details: serde_json::Value,
    /// Persistence timestamp, assigned by the store.
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventRecord {{ id: {}, user: {}, type: {} }}",
            self.id, self.user_id, self.event_type
        )
    }
}
