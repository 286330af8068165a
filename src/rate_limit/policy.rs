use crate::error::PolicyError;
use std::time::Duration;

/// Longest idle expiry written to a store (30 days).
///
/// Very slow policies would otherwise ask for TTLs that overflow `Instant` arithmetic or
/// that Redis rejects as an invalid `PX`. A bucket idle this long restarts full.
pub const MAX_IDLE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Refill rate and bucket size applied to one client.
///
/// Plain data so callers can build it from any configuration source; it is validated by
/// [`Policy::validate`] on every evaluation, before the store is touched.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct Policy {
    /// Tokens added per second.
    pub rate: f64,
    /// Bucket size; also the burst allowance.
    pub capacity: u32,
}

impl Policy {
    /// Build a validated policy.
    pub fn new(rate: f64, capacity: u32) -> Result<Self, PolicyError> {
        let policy = Self { rate, capacity };
        policy.validate()?;
        Ok(policy)
    }

    /// `count` requests per `period`, with a burst of `count`.
    ///
    /// `Policy::per_period(10, Duration::from_secs(60))` refills one token every six seconds.
    pub fn per_period(count: u32, period: Duration) -> Result<Self, PolicyError> {
        if period.is_zero() {
            return Err(PolicyError::ZeroPeriod);
        }
        Self::new(f64::from(count) / period.as_secs_f64(), count)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(PolicyError::InvalidRate(self.rate));
        }
        if self.capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        Ok(())
    }

    /// Capacity as a token count.
    pub fn capacity_tokens(&self) -> f64 {
        f64::from(self.capacity)
    }

    /// Time for an empty bucket to refill completely.
    pub fn full_refill(&self) -> Duration {
        secs_to_duration(self.capacity_tokens() / self.rate)
    }

    /// Idle expiry for stored buckets: `factor` full refills, between one second and
    /// [`MAX_IDLE_TTL`].
    ///
    /// Once a bucket has been idle this long it would be full again, so letting the store
    /// evict it loses nothing.
    pub fn idle_ttl(&self, factor: u32) -> Duration {
        let ttl = secs_to_duration(self.full_refill().as_secs_f64() * f64::from(factor.max(1)));
        ttl.clamp(Duration::from_secs(1), MAX_IDLE_TTL)
    }
}

/// Saturating, NaN-safe seconds to `Duration` conversion.
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_or_non_finite_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(Policy::new(rate, 1), Err(PolicyError::InvalidRate(_))));
        }
    }

    #[test]
    fn rejects_zero_capacity() {
        assert_eq!(Policy::new(1.0, 0), Err(PolicyError::ZeroCapacity));
    }

    #[test]
    fn per_period_matches_requests_per_minute() {
        let policy = Policy::per_period(10, Duration::from_secs(60)).unwrap();
        assert!((policy.rate - 10.0 / 60.0).abs() < 1e-12);
        assert_eq!(policy.capacity, 10);
        assert_eq!(Policy::per_period(10, Duration::ZERO), Err(PolicyError::ZeroPeriod));
    }

    #[test]
    fn idle_ttl_is_multiple_of_full_refill() {
        let policy = Policy::new(0.5, 10).unwrap();
        assert_eq!(policy.full_refill(), Duration::from_secs(20));
        assert_eq!(policy.idle_ttl(2), Duration::from_secs(40));
        // Zero factor is treated as one.
        assert_eq!(policy.idle_ttl(0), Duration::from_secs(20));
    }

    #[test]
    fn idle_ttl_has_one_second_floor() {
        let fast = Policy::new(1000.0, 1).unwrap();
        assert_eq!(fast.idle_ttl(2), Duration::from_secs(1));
    }

    #[test]
    fn idle_ttl_is_capped_for_very_slow_rates() {
        let glacial = Policy::new(1e-20, 1).unwrap();
        assert_eq!(glacial.full_refill(), Duration::MAX);
        assert_eq!(glacial.idle_ttl(2), MAX_IDLE_TTL);
        assert_eq!(Policy::new(1e-300, u32::MAX).unwrap().idle_ttl(u32::MAX), MAX_IDLE_TTL);
    }

    #[test]
    fn plain_struct_can_bypass_constructor_but_not_validation() {
        let policy = Policy { rate: 1.0, capacity: 0 };
        assert_eq!(policy.validate(), Err(PolicyError::ZeroCapacity));
    }
}
