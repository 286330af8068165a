//! Distributed token-bucket admission.
//!
//! This module provides the building blocks:
//! - [`RateLimiter`]: the admission contract, `evaluate(client_id, policy) -> Decision`.
//! - [`Decision`]: admitted (with remaining tokens) or denied (with a retry hint).
//! - [`Policy`]: refill rate and capacity, validated before any store access.
//!
//! # Architecture
//!
//! - **Engine**: [`TokenBucket`](strategies::TokenBucket) owns no client state. Every call
//!   is one atomic read-modify-write against the shared store.
//! - **Math**: [`bucket::transition`] is the refill-on-read step as a pure function.
//! - **Storage**: [`BucketStore`](store::BucketStore) is the atomic `get_and_update`
//!   primitive. [`CasStore`](store::CasStore) builds it from any
//!   [`VersionedStore`](store::VersionedStore) with a bounded compare-and-swap loop;
//!   [`InMemoryStore`](memory::InMemoryStore) is the single-process backend. Redis lives in
//!   the `tollgate-redis` crate.
//! - **Middleware**: [`AdmissionLayer`] asks a `RateLimiter` per request and applies the
//!   caller's fail-open/fail-closed choice.

use crate::error::LimiterError;
use std::time::Duration;

pub mod bucket;
pub mod memory;
pub mod middleware;
pub mod policy;
pub mod store;
pub mod strategies;

pub use bucket::{BucketState, Transition};
pub use memory::InMemoryStore;
pub use middleware::{AdmissionError, AdmissionLayer, AdmissionService, FailureMode};
pub use policy::Policy;
pub use store::{AdapterConfig, AdapterConfigBuilder, BucketStore, CasStore, Committed, VersionedStore};
pub use strategies::TokenBucket;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Admitted {
        /// Tokens left after this request. Useful for `X-RateLimit-Remaining` headers.
        remaining: f64,
    },
    /// The request is rejected.
    Denied {
        /// Estimated wait until one token is available. Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    /// Retry hint, present only on denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Denied { retry_after } => Some(*retry_after),
            Decision::Admitted { .. } => None,
        }
    }

    /// Retry hint in seconds, `None` when admitted.
    pub fn retry_after_seconds(&self) -> Option<f64> {
        self.retry_after().map(|d| d.as_secs_f64())
    }

    /// Whole tokens left for `X-RateLimit-Remaining`; zero when denied.
    pub fn remaining_whole(&self) -> u64 {
        match self {
            Decision::Admitted { remaining } => remaining.max(0.0).floor() as u64,
            Decision::Denied { .. } => 0,
        }
    }
}

/// Admission contract consumed by middleware.
///
/// Implementations must be safe to call concurrently from many tasks and many processes
/// sharing one store, and must reject invalid input before touching the store.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether the request from `client_id` is admitted under `policy`.
    async fn evaluate(&self, client_id: &str, policy: &Policy) -> Result<Decision, LimiterError>;
}

#[async_trait::async_trait]
impl<L> RateLimiter for std::sync::Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn evaluate(&self, client_id: &str, policy: &Policy) -> Result<Decision, LimiterError> {
        (**self).evaluate(client_id, policy).await
    }
}
