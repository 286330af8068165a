//! Clock abstractions used by the admission engine.
//!
//! Bucket timestamps are shared between service instances, so they are wall-clock seconds
//! since the Unix epoch rather than process-local `Instant`s. Skew between instances is
//! absorbed by the engine (elapsed time is clamped at zero and stored timestamps never move
//! backwards).

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds since the Unix epoch, with sub-second precision.
    fn now_secs(&self) -> f64;
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        // A clock set before 1970 reads as the epoch; the engine clamps elapsed time anyway.
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Start the clock at `start_secs` (epoch seconds).
    pub fn new(start_secs: f64) -> Self {
        Self { now: Arc::new(Mutex::new(start_secs)) }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by.as_secs_f64();
    }

    /// Jump to an absolute time; may move backwards to simulate skewed instances.
    pub fn set(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = secs;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000.0)
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
