//! Convenient re-exports for wiring a limiter into a service.
pub use crate::{
    clock::{Clock, SystemClock},
    error::{LimiterError, StoreError},
    rate_limit::{
        store::{AdapterConfig, BucketStore, CasStore, VersionedStore},
        AdmissionError, AdmissionLayer, Decision, FailureMode, InMemoryStore, Policy,
        RateLimiter, TokenBucket,
    },
    telemetry::{LimiterEvent, LogSink, TelemetrySink},
    Backoff, DynamicConfig, Jitter,
};
