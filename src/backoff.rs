//! Capped exponential backoff for connection retries.
//!
//! Attempt semantics follow the connection attempt number: attempt `1` is the first connection
//! attempt, and the delay returned for attempt `n` is the wait *after* attempt `n` failed,
//! `min(max, base * 2^(n-1))`. Attempt `0` is not a real attempt and yields zero.
//!
//! ```rust
//! use std::time::Duration;
//! use lobbyline::Backoff;
//!
//! let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2)).unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use crate::error::ConfigError;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Exponential backoff starting at `base` and capped at `max`.
    /// Returns an error if `max` is zero or `max < base`.
    pub fn new(base: Duration, max: Duration) -> Result<Self, ConfigError> {
        if max.is_zero() {
            return Err(ConfigError::MaxDelayMustBePositive);
        }
        if max < base {
            return Err(ConfigError::MaxLessThanBase { base, max });
        }
        Ok(Self { base, max })
    }

    pub(crate) const fn from_parts(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Un-jittered delay after the given (1-based) attempt failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt - 1;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        exp_delay.min(self.max).min(MAX_BACKOFF)
    }
}
