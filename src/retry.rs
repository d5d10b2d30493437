//! Retry policy for connection attempts.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - [`RetryPolicy::next_delay`] is consulted after attempt `n` failed with a classified
//!   [`ErrorKind`]; it answers whether attempt `n + 1` should happen and how long to wait first.
//! - Delay is `min(max_delay, base_delay * 2^(n-1))`, then multiplied by a uniform factor in
//!   `[1 - jitter_fraction, 1 + jitter_fraction]`.
//!
//! Invariants:
//! - `attempt >= max_attempts` never retries.
//! - `NotFound` and `ResourceExhausted` never retry, whatever the attempt number.
//! - The policy holds no per-session state; the same policy can serve any number of Joins.
//!
//! ```rust
//! use std::time::Duration;
//! use lobbyline::{ErrorKind, RetryConfig};
//!
//! let policy = RetryConfig::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(2))
//!     .jitter_fraction(0.0)
//!     .build()
//!     .unwrap()
//!     .policy();
//!
//! let decision = policy.next_delay(1, ErrorKind::Timeout);
//! assert!(decision.retry);
//! assert_eq!(decision.delay, Duration::from_millis(100));
//! assert!(!policy.next_delay(3, ErrorKind::Timeout).retry);
//! assert!(!policy.next_delay(1, ErrorKind::NotFound).retry);
//! ```

use crate::error::ConfigError;
use crate::{Backoff, ErrorKind, Jitter};
use rand::Rng;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MILLIS: u64 = 500;
const DEFAULT_MAX_DELAY_SECS: u64 = 10;
const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Validated retry configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
}

impl RetryConfig {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Assemble already-validated parts. Callers must uphold `max_attempts >= 1`.
    pub(crate) const fn from_parts(max_attempts: u32, backoff: Backoff, jitter: Jitter) -> Self {
        Self { max_attempts, backoff, jitter }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.backoff.base()
    }

    pub fn max_delay(&self) -> Duration {
        self.backoff.max()
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter.fraction()
    }

    /// The policy this configuration describes.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy { config: *self }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::from_parts(
                Duration::from_millis(DEFAULT_BASE_DELAY_MILLIS),
                Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            ),
            jitter: Jitter::Proportional(DEFAULT_JITTER_FRACTION),
        }
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl RetryConfigBuilder {
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MILLIS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }

    /// Set total attempts (initial + retries). Must be >= 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Fraction in `[0, 1)`; `0` disables jitter.
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Build the configuration, validating inputs.
    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        Ok(RetryConfig {
            max_attempts: self.max_attempts,
            backoff: Backoff::new(self.base_delay, self.max_delay)?,
            jitter: Jitter::proportional(self.jitter_fraction)?,
        })
    }
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Answer from [`RetryPolicy::next_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Wait before the next attempt; zero when `retry` is false.
    pub delay: Duration,
}

impl RetryDecision {
    fn stop() -> Self {
        Self { retry: false, delay: Duration::ZERO }
    }
}

/// Stateless retry decision function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what follows a failed `attempt` (1-based) that was classified as `kind`.
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        self.next_delay_with_rng(attempt, kind, &mut rand::rng())
    }

    /// As [`next_delay`](Self::next_delay) with an injected RNG (for testing).
    pub fn next_delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        kind: ErrorKind,
        rng: &mut R,
    ) -> RetryDecision {
        if attempt >= self.config.max_attempts || !kind.is_retryable() {
            return RetryDecision::stop();
        }
        let delay = self.config.backoff.delay(attempt.max(1));
        RetryDecision { retry: true, delay: self.config.jitter.apply_with_rng(delay, rng) }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().policy()
    }
}
