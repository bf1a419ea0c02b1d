//! Achievement vocabulary and unlock storage.
//!
//! Each event type can award one achievement the first time a user performs
//! it. Unlocks are durable rows keyed by `(user_id, name)` with a uniqueness
//! constraint, so unlocking is an insert-if-absent and is naturally
//! idempotent under aggregation retries.

use crate::event_store::PersistenceError;
use crate::ids::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// The fixed set of achievements a user can unlock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    /// First login.
    Beginner,
    /// First secret found.
    Researcher,
    /// First completed level.
    Master,
}

impl Achievement {
    /// The stable name stored in the database and shown to clients.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "Beginner",
            Self::Researcher => "Researcher",
            Self::Master => "Master",
        }
    }

    /// Parse an achievement from its stored name.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Serialization`] for names not in the
    /// vocabulary (a stored row we no longer understand).
    pub fn parse(s: &str) -> Result<Self, PersistenceError> {
        match s {
            "Beginner" => Ok(Self::Beginner),
            "Researcher" => Ok(Self::Researcher),
            "Master" => Ok(Self::Master),
            other => Err(PersistenceError::Serialization(format!(
                "Unknown achievement name: {other}"
            ))),
        }
    }
}

impl fmt::Display for Achievement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An achievement a user has unlocked, with when it happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockedAchievement {
    /// Which achievement.
    pub achievement: Achievement,
    /// When the unlock row was committed.
    pub unlocked_at: DateTime<Utc>,
}

/// Durable storage of achievement unlocks.
///
/// Implementations: `PostgresAchievementStore` (production),
/// `InMemoryAchievementStore` (testing).
pub trait AchievementStore: Send + Sync {
    /// Record an unlock if the user does not already have it.
    ///
    /// Returns `true` when this call created the unlock (the caller should
    /// notify the user) and `false` when it already existed. Concurrent
    /// callers for the same `(user, achievement)` pair resolve via the
    /// uniqueness constraint: exactly one observes `true`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the write fails; the unlock can be
    /// retried safely.
    fn unlock(
        &self,
        user_id: UserId,
        achievement: Achievement,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>>;

    /// All achievements the user has unlocked, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the query fails.
    fn unlocked(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<UnlockedAchievement>, PersistenceError>> + Send + '_>>;
}
