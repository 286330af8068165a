#![allow(dead_code)]

use tollgate::{
    AdapterConfig, CasStore, InMemoryStore, InstantSleeper, Jitter, ManualClock, MemorySink,
    TokenBucket,
};

/// Adapter configuration that never sleeps between attempts.
pub fn instant_config(max_attempts: usize) -> AdapterConfig {
    AdapterConfig::builder()
        .max_attempts(max_attempts)
        .with_sleeper(InstantSleeper)
        .with_jitter(Jitter::None)
        .build()
        .expect("valid adapter config")
}

/// In-memory engine driven by `clock`, recording events.
pub fn memory_limiter(
    clock: &ManualClock,
    max_attempts: usize,
) -> TokenBucket<CasStore<InMemoryStore>, MemorySink> {
    TokenBucket::new(CasStore::with_config(InMemoryStore::new(), instant_config(max_attempts)))
        .with_clock(clock.clone())
        .with_sink(MemorySink::new())
}

/// Route `tracing` output through the test harness; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
