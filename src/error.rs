//! Error types for admission decisions and store adapters.
//!
//! Taxonomy:
//! - [`LimiterError::InvalidPolicy`] / [`LimiterError::InvalidClientId`]: caller
//!   misconfiguration, rejected before any store access and never retried.
//! - [`LimiterError::StoreUnavailable`]: transient infrastructure failure. The adapter has
//!   already spent its retry budget by the time this reaches the caller; the caller picks
//!   fail-open or fail-closed.
use std::time::Duration;

/// Reasons a [`Policy`](crate::rate_limit::Policy) is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    /// Refill rate must be finite and strictly positive.
    #[error("rate must be a finite value > 0 (got {0})")]
    InvalidRate(f64),
    /// Capacity must allow at least one request.
    #[error("capacity must be >= 1")]
    ZeroCapacity,
    /// `per_period` needs a non-zero period.
    #[error("period must be greater than zero")]
    ZeroPeriod,
}

/// Failures surfaced by a shared state store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A single store round trip exceeded its deadline.
    #[error("store call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// Every optimistic attempt lost its compare-and-swap race.
    #[error("compare-and-swap contended on every attempt ({attempts} attempts)")]
    Contended { attempts: usize },
    /// The store rejected the call or could not be reached.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value could not be decoded.
    #[error("corrupt bucket state under '{key}': {detail}")]
    Corrupt { key: String, detail: String },
}

impl StoreError {
    /// Wrap any displayable backend error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error came from exhausting the compare-and-swap budget.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Contended { .. })
    }

    /// Whether another attempt might succeed. Corrupt state will not heal by retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Corrupt { .. })
    }
}

/// Error returned by [`RateLimiter::evaluate`](crate::rate_limit::RateLimiter::evaluate).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimiterError {
    /// The policy failed validation; no store access was made.
    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(#[from] PolicyError),
    /// The client identity was empty; no store access was made.
    #[error("client id must not be empty")]
    InvalidClientId,
    /// The shared store could not complete the atomic update.
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl LimiterError {
    /// Check if this error is caller misconfiguration rather than infrastructure.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, Self::InvalidPolicy(_) | Self::InvalidClientId)
    }

    /// Check if the store was unavailable.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Check if the failure was the compare-and-swap budget running out.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StoreUnavailable(e) if e.is_conflict())
    }

    /// Borrow the underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::StoreUnavailable(e) => Some(e),
            _ => None,
        }
    }
}
