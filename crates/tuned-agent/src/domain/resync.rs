//! # Resync period
//!
//! One backoff value shared by the reconciliation loop and the retry wrapper. The loop
//! uses `current` as the interval of its full label pull and shrinks it back toward
//! `minimum` after every successful pull; the retry wrapper doubles it after every failed
//! attempt and sleeps for the doubled value before retrying. Persistent failure is fatal:
//! once a doubling would exceed `maximum` the wrapper gives up.

use std::time::Duration;

use rand::Rng;

/// Backoff state for the full-resync interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncPeriod {
    current: Duration,
    minimum: Duration,
    maximum: Duration,
}

/// Returned by [`ResyncPeriod::back_off`] when doubling would pass the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CeilingExceeded {
    pub attempted: Duration,
    pub maximum: Duration,
}

impl ResyncPeriod {
    /// Create a resync period starting (and floored) at `minimum`.
    pub fn new(minimum: Duration, maximum: Duration) -> Self {
        Self {
            current: minimum,
            minimum,
            maximum,
        }
    }

    /// Create a resync period whose floor is `base` shifted by a random jitter of
    /// `±factor/2`, so agents on different nodes do not poll the API server in lockstep.
    pub fn with_jitter(base: Duration, factor: f64, maximum: Duration) -> Self {
        Self::new(duration_with_jitter(base, factor), maximum)
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Double `current` after a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns [`CeilingExceeded`] and leaves `current` untouched when the doubled value
    /// would be greater than `maximum`.
    pub fn back_off(&mut self) -> Result<Duration, CeilingExceeded> {
        let attempted = self.current.saturating_mul(2);
        if attempted > self.maximum {
            return Err(CeilingExceeded {
                attempted,
                maximum: self.maximum,
            });
        }
        self.current = attempted;
        Ok(self.current)
    }

    /// Halve `current` toward `minimum` after a successful pull.
    ///
    /// Returns true when the period changed and the pull timer has to be re-armed.
    pub fn shrink(&mut self) -> bool {
        let halved = (self.current / 2).max(self.minimum);
        if halved == self.current {
            return false;
        }
        self.current = halved;
        true
    }
}

/// Shift `base` by a uniformly random offset in `±base * factor / 2`.
pub fn duration_with_jitter(base: Duration, factor: f64) -> Duration {
    let jitter_range = base.as_secs_f64() * factor / 2.0;
    if jitter_range <= 0.0 {
        return base;
    }
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((base.as_secs_f64() + jitter_offset).max(0.0))
}
