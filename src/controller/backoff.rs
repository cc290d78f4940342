//! # Exponential Backoff
//!
//! Provides a bounded exponential backoff for descriptors whose reconciliation
//! failed. Each descriptor owns its own instance, so one failing descriptor
//! never slows down another.
//!
//! Sequence with base 5s and cap 300s: 5s, 10s, 20s, 40s, 80s, 160s, 300s (max).
//!
//! ## Usage
//!
//! ```rust
//! use secret_sync_controller::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(20));
//! ```

use std::time::Duration;

/// Exponential backoff calculator
///
/// Each call to [`ExponentialBackoff::next_backoff`] returns the current delay
/// and doubles it for the next call, never exceeding `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial delay (restored by `reset`)
    base: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Upper bound
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `base` and capped at `max`
    ///
    /// A `max` lower than `base` is raised to `base`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            current: base,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }

    /// Peek at the delay the next call would return
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Backoff state for a specific descriptor
/// Tracks the consecutive error count and the backoff calculator
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: ExponentialBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(base, max),
            error_count: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn record_failure(&mut self) -> Duration {
        self.error_count = self.error_count.saturating_add(1);
        self.backoff.next_backoff()
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}
