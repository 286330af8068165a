//! Backoff between store attempts.
//!
//! Attempt `0` is the first store round trip and never waits; retries start at `attempt = 1`.
//! Store retries sit on the request path, so every delay saturates at [`MAX_BACKOFF`]
//! regardless of configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use tollgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(5))
//!     .with_max(Duration::from_millis(40))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(5));
//! assert_eq!(backoff.delay(3), Duration::from_millis(20));
//! assert_eq!(backoff.delay(9), Duration::from_millis(40));
//! ```

use std::time::Duration;

/// Hard ceiling for any single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for linear or exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Constant { delay: Duration },
    Linear { base: Duration, max: Option<Duration> },
    Exponential { base: Duration, max: Option<Duration> },
}

/// Delay schedule applied between store attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// `base * attempt`.
    pub fn linear(base: Duration) -> Self {
        Self { kind: BackoffKind::Linear { base, max: None } }
    }

    /// `base * 2^(attempt - 1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, max: None } }
    }

    /// Cap a linear or exponential schedule.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Linear { base, max: existing }
            | BackoffKind::Exponential { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Delay to wait before `attempt` (0-based; 0 = first round trip, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Linear { base, max } => {
                let factor = attempt.min(u32::MAX as usize) as u32;
                let linear = base.checked_mul(factor).unwrap_or(MAX_BACKOFF);
                max.map_or(linear, |m| linear.min(m))
            }
            BackoffKind::Exponential { base, max } => {
                let exponent = (attempt - 1).min(u32::MAX as usize) as u32;
                let nanos = base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                let exp = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map_or(exp, |m| exp.min(m))
            }
        };
        raw.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    /// 5ms doubling, capped at 100ms.
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential {
                base: Duration::from_millis(5),
                max: Some(Duration::from_millis(100)),
            },
        }
    }
}
