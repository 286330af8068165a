//! Jitter applied to backoff delays so instances that lost the same compare-and-swap race
//! do not retry in lockstep.
//!
//! - `None`: exact delay, for deterministic tests.
//! - `Full`: uniform in `[0, delay]`; the default.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor.
//!
//! Randomness comes from `rand`'s thread-local RNG; `apply_with_rng` takes an explicit one.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the backoff delay unchanged.
    None,
    /// Random between 0 and delay.
    #[default]
    Full,
    /// Random between delay/2 and delay.
    Equal,
}

impl Jitter {
    /// Create a full jitter strategy.
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Create an equal jitter strategy.
    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Apply jitter to a delay using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-provided RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        // Microsecond granularity keeps sub-millisecond backoffs meaningful.
        let micros: u64 = delay.as_micros().try_into().unwrap_or(u64::MAX);
        if micros == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_micros(rng.random_range(0..=micros)),
            Jitter::Equal => Duration::from_micros(rng.random_range(micros / 2..=micros)),
        }
    }
}
