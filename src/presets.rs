//! Ready-made [`JoinConfig`] profiles.
//!
//! Each preset fixes retry, per-resource timeout, concurrency and connect timeout for a
//! typical network environment, so callers don't have to tune four knobs by hand.
//!
//! ```rust
//! use lobbyline::presets;
//!
//! let config = presets::internet();
//! assert_eq!(config.retry().max_attempts(), 4);
//! assert!(config.connect_timeout() > presets::lan().connect_timeout());
//! ```
//!
//! ## Available Presets
//!
//! - [`lan`]: low latency, few retries, wide fan-out
//! - [`internet`]: the default profile for public lobbies
//! - [`mobile`]: slow, lossy links; patient retries, narrow fan-out
//! - [`testing`]: no jitter and tiny delays, for deterministic tests

use crate::backoff::Backoff;
use crate::controller::JoinConfig;
use crate::jitter::Jitter;
use crate::retry::RetryConfig;
use std::time::Duration;

const LAN_MAX_ATTEMPTS: u32 = 2;
const LAN_BASE_DELAY_MILLIS: u64 = 50;
const LAN_MAX_DELAY_MILLIS: u64 = 500;
const LAN_JITTER: f64 = 0.1;
const LAN_PER_ITEM_TIMEOUT_SECS: u64 = 2;
const LAN_CONCURRENCY: usize = 16;
const LAN_CONNECT_TIMEOUT_MILLIS: u64 = 750;

const INTERNET_MAX_ATTEMPTS: u32 = 4;
const INTERNET_BASE_DELAY_MILLIS: u64 = 500;
const INTERNET_MAX_DELAY_SECS: u64 = 8;
const INTERNET_JITTER: f64 = 0.2;
const INTERNET_PER_ITEM_TIMEOUT_SECS: u64 = 10;
const INTERNET_CONCURRENCY: usize = 6;
const INTERNET_CONNECT_TIMEOUT_SECS: u64 = 5;

const MOBILE_MAX_ATTEMPTS: u32 = 6;
const MOBILE_BASE_DELAY_SECS: u64 = 1;
const MOBILE_MAX_DELAY_SECS: u64 = 30;
const MOBILE_JITTER: f64 = 0.3;
const MOBILE_PER_ITEM_TIMEOUT_SECS: u64 = 30;
const MOBILE_CONCURRENCY: usize = 2;
const MOBILE_CONNECT_TIMEOUT_SECS: u64 = 15;

const TESTING_MAX_ATTEMPTS: u32 = 3;
const TESTING_BASE_DELAY_MILLIS: u64 = 1;
const TESTING_MAX_DELAY_MILLIS: u64 = 10;
const TESTING_PER_ITEM_TIMEOUT_MILLIS: u64 = 250;
const TESTING_CONCURRENCY: usize = 4;
const TESTING_CONNECT_TIMEOUT_MILLIS: u64 = 250;

/// Local network: 2 attempts, 50 ms → 500 ms backoff, 16 concurrent loads.
pub fn lan() -> JoinConfig {
    JoinConfig::from_parts(
        RetryConfig::from_parts(
            LAN_MAX_ATTEMPTS,
            Backoff::from_parts(
                Duration::from_millis(LAN_BASE_DELAY_MILLIS),
                Duration::from_millis(LAN_MAX_DELAY_MILLIS),
            ),
            Jitter::Proportional(LAN_JITTER),
        ),
        Duration::from_secs(LAN_PER_ITEM_TIMEOUT_SECS),
        LAN_CONCURRENCY,
        Duration::from_millis(LAN_CONNECT_TIMEOUT_MILLIS),
    )
}

/// Public internet: 4 attempts, 500 ms → 8 s backoff, 6 concurrent loads.
pub fn internet() -> JoinConfig {
    JoinConfig::from_parts(
        RetryConfig::from_parts(
            INTERNET_MAX_ATTEMPTS,
            Backoff::from_parts(
                Duration::from_millis(INTERNET_BASE_DELAY_MILLIS),
                Duration::from_secs(INTERNET_MAX_DELAY_SECS),
            ),
            Jitter::Proportional(INTERNET_JITTER),
        ),
        Duration::from_secs(INTERNET_PER_ITEM_TIMEOUT_SECS),
        INTERNET_CONCURRENCY,
        Duration::from_secs(INTERNET_CONNECT_TIMEOUT_SECS),
    )
}

/// Cellular links: 6 attempts, 1 s → 30 s backoff, 2 concurrent loads.
pub fn mobile() -> JoinConfig {
    JoinConfig::from_parts(
        RetryConfig::from_parts(
            MOBILE_MAX_ATTEMPTS,
            Backoff::from_parts(
                Duration::from_secs(MOBILE_BASE_DELAY_SECS),
                Duration::from_secs(MOBILE_MAX_DELAY_SECS),
            ),
            Jitter::Proportional(MOBILE_JITTER),
        ),
        Duration::from_secs(MOBILE_PER_ITEM_TIMEOUT_SECS),
        MOBILE_CONCURRENCY,
        Duration::from_secs(MOBILE_CONNECT_TIMEOUT_SECS),
    )
}

/// Deterministic profile for tests: 3 attempts, 1 ms → 10 ms backoff, no jitter.
pub fn testing() -> JoinConfig {
    JoinConfig::from_parts(
        RetryConfig::from_parts(
            TESTING_MAX_ATTEMPTS,
            Backoff::from_parts(
                Duration::from_millis(TESTING_BASE_DELAY_MILLIS),
                Duration::from_millis(TESTING_MAX_DELAY_MILLIS),
            ),
            Jitter::None,
        ),
        Duration::from_millis(TESTING_PER_ITEM_TIMEOUT_MILLIS),
        TESTING_CONCURRENCY,
        Duration::from_millis(TESTING_CONNECT_TIMEOUT_MILLIS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuilt(config: &JoinConfig) -> JoinConfig {
        let retry = RetryConfig::builder()
            .max_attempts(config.retry().max_attempts())
            .base_delay(config.retry().base_delay())
            .max_delay(config.retry().max_delay())
            .jitter_fraction(config.retry().jitter_fraction())
            .build()
            .expect("preset retry config must validate");
        JoinConfig::builder()
            .retry(retry)
            .per_item_timeout(config.per_item_timeout())
            .concurrency_limit(config.concurrency_limit())
            .connect_timeout(config.connect_timeout())
            .build()
            .expect("preset join config must validate")
    }

    #[test]
    fn presets_pass_builder_validation() {
        for preset in [lan(), internet(), mobile(), testing()] {
            assert_eq!(rebuilt(&preset), preset);
        }
    }

    #[test]
    fn testing_preset_is_deterministic() {
        let policy = testing().retry().policy();
        let first = policy.next_delay(1, crate::ErrorKind::Timeout);
        assert_eq!(first.delay, Duration::from_millis(1));
        assert_eq!(policy.next_delay(2, crate::ErrorKind::Timeout).delay, Duration::from_millis(2));
    }

    #[test]
    fn profiles_scale_with_link_quality() {
        assert!(lan().concurrency_limit() > internet().concurrency_limit());
        assert!(internet().concurrency_limit() > mobile().concurrency_limit());
        assert!(mobile().retry().max_attempts() > internet().retry().max_attempts());
    }
}
