//! Proportional jitter to keep reconnecting clients from retrying in lockstep.
//!
//! `Jitter::proportional(f)` multiplies a delay by a uniform random factor in
//! `[1 - f, 1 + f]`, with `f` in `[0, 1)`. `Jitter::None` returns the delay unchanged, which is
//! what deterministic tests want.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//!   `apply_with_rng`.
//! - The jittered delay may exceed the backoff cap by up to `f`; the cap bounds the backoff,
//!   not the jitter.
//!
//! ```rust
//! use lobbyline::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::proportional(0.2).unwrap();
//! let delay = jitter.apply(Duration::from_millis(1000));
//! assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
//! ```

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Multiply by a uniform factor in `[1 - fraction, 1 + fraction]`.
    Proportional(f64),
}

impl Jitter {
    /// Create a proportional jitter strategy. `fraction` must lie in `[0, 1)`.
    pub fn proportional(fraction: f64) -> Result<Self, ConfigError> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(ConfigError::InvalidJitterFraction(fraction));
        }
        if fraction == 0.0 {
            return Ok(Jitter::None);
        }
        Ok(Jitter::Proportional(fraction))
    }

    /// The configured fraction (`0.0` for `None`).
    pub fn fraction(&self) -> f64 {
        match self {
            Jitter::None => 0.0,
            Jitter::Proportional(f) => *f,
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional(fraction) => {
                if delay.is_zero() {
                    return delay;
                }
                let factor = rng.random_range((1.0 - fraction)..=(1.0 + fraction));
                Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn proportional_stays_within_band() {
        let jitter = Jitter::proportional(0.25).unwrap();
        let delay = Duration::from_millis(1000);

        for _ in 0..200 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(750), "{:?}", jittered);
            assert!(jittered <= Duration::from_millis(1250), "{:?}", jittered);
        }
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let jitter = Jitter::proportional(0.5).unwrap();
        let delay = Duration::from_millis(400);

        let a = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(42));
        let b = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
        assert!(a >= Duration::from_millis(200) && a <= Duration::from_millis(600));
    }

    #[test]
    fn zero_fraction_collapses_to_none() {
        assert_eq!(Jitter::proportional(0.0).unwrap(), Jitter::None);
    }

    #[test]
    fn rejects_out_of_range_fractions() {
        assert!(matches!(Jitter::proportional(1.0), Err(ConfigError::InvalidJitterFraction(_))));
        assert!(matches!(Jitter::proportional(-0.1), Err(ConfigError::InvalidJitterFraction(_))));
        assert!(Jitter::proportional(f64::NAN).is_err());
    }

    #[test]
    fn zero_delay_stays_zero() {
        let jitter = Jitter::proportional(0.9).unwrap();
        assert_eq!(jitter.apply(Duration::ZERO), Duration::ZERO);
    }
}
