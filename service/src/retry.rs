//! Retry policy with exponential backoff for transient counter failures.
//!
//! The aggregation worker retries `CounterUnavailable` errors with
//! exponentially growing delays plus a little jitter so that many parked
//! jobs do not stampede a recovering Redis all at once.

use rand::Rng;
use std::time::Duration;

/// Retry policy configuration for exponential backoff.
///
/// # Default values
///
/// - `max_retries`: 5
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial try.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for the exponential backoff.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for tests that want failures to surface
    /// immediately.
    #[must_use]
    pub const fn no_retries() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
            multiplier: 1.0,
        }
    }

    /// Set the maximum number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Backoff delay for a given attempt number (0-based), without jitter.
    ///
    /// `delay = initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ms =
            (self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32)) as u64;

        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Backoff delay with up to 25% random jitter added.
    #[must_use]
    pub fn jittered_delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if base.is_zero() {
            return base;
        }
        let jitter_cap = (base / 4).max(Duration::from_millis(1));
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..jitter_cap);
        (base + jitter).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let base = policy.delay_for_attempt(attempt);
            let jittered = policy.jittered_delay_for_attempt(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base + base / 4 + Duration::from_millis(1));
        }
    }

    #[test]
    fn no_retries_policy_has_zero_attempts() {
        let policy = RetryPolicy::no_retries();
        assert_eq!(policy.max_retries, 0);
        assert!(policy.jittered_delay_for_attempt(0).is_zero());
    }
}
