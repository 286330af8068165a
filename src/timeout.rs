//! Per-call deadline for store round trips.

use crate::error::StoreError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Wraps a single store call so it can never hang the caller.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Panics if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Self {
        assert!(
            duration > Duration::ZERO && duration < Duration::MAX,
            "timeout duration must be non-zero and finite",
        );
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `call`, mapping an expired deadline to [`StoreError::Timeout`].
    pub async fn execute<T, Fut>(&self, call: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
