#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Distributed token-bucket admission for Rust services: per-client state in a shared
//! store, refill on read, and one atomic read-modify-write per decision so any number of
//! instances can enforce the same limit.
//!
//! ## Features
//!
//! - **Token bucket engine** that holds no per-client state between calls
//! - **Store adapters** behind an atomic `get_and_update` contract, with a bounded
//!   compare-and-swap loop for versioned backends (Redis lives in `tollgate-redis`)
//! - **Retry primitives** for store calls: backoff, jitter, and per-attempt timeouts
//! - **Tower middleware** with explicit fail-open or fail-closed behaviour
//! - **Telemetry** events through pluggable `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{CasStore, InMemoryStore, Policy, RateLimiter, TokenBucket};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = TokenBucket::new(CasStore::new(InMemoryStore::new()));
//!     let policy = Policy::per_period(10, Duration::from_secs(60)).unwrap();
//!
//!     let decision = limiter.evaluate("203.0.113.7", &policy).await.unwrap();
//!     assert!(decision.is_admitted());
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod clock;
#[cfg(feature = "config")]
pub mod config;
pub mod error;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod sleeper;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LimiterError, PolicyError, StoreError};
pub use jitter::Jitter;
pub use rate_limit::{
    AdapterConfig, AdapterConfigBuilder, AdmissionError, AdmissionLayer, AdmissionService,
    BucketState, BucketStore, CasStore, Committed, Decision, FailureMode, InMemoryStore, Policy,
    RateLimiter, TokenBucket, VersionedStore,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use timeout::TimeoutPolicy;
