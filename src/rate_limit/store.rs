//! Shared state store adapters.
//!
//! The engine only needs one primitive, [`BucketStore::get_and_update`]: read the bucket,
//! apply a transform, write the result, as one linearizable step per key. Backends that
//! offer a conditional write implement the smaller [`VersionedStore`] contract and get the
//! atomic primitive from [`CasStore`], which runs a bounded optimistic loop:
//!
//! 1. `load` the state together with an opaque version,
//! 2. compute the next state,
//! 3. `compare_and_swap` it, succeeding only if the version is unchanged,
//! 4. on conflict back off (with jitter) and start over, up to `max_attempts`.
//!
//! Each attempt runs under the configured per-call timeout. Retry count, backoff, and
//! timeout are adapter configuration ([`AdapterConfig`]); the algorithm never retries on its
//! own.

use crate::error::StoreError;
use crate::rate_limit::bucket::BucketState;
use crate::timeout::TimeoutPolicy;
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// State read from a [`VersionedStore`] plus the token needed to write it back conditionally.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub state: BucketState,
    pub version: V,
}

/// Backend with a conditional write, e.g. a version counter or a server-side CAS script.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Opaque version compared by `compare_and_swap`.
    type Version: Clone + Send + Sync + std::fmt::Debug;

    /// Fetch the current state for a key, `None` if absent or expired.
    async fn load(&self, key: &str) -> Result<Option<Versioned<Self::Version>>, StoreError>;

    /// Write `next` (refreshing the idle `ttl`) only if the key still holds `expected`.
    ///
    /// `expected = None` means the key must still be absent. Returns `Ok(false)` when
    /// another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Self::Version>,
        next: &BucketState,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

/// Result of a committed atomic update.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    /// State the winning transform observed (`None` for a brand-new key).
    pub previous: Option<BucketState>,
    /// State now stored.
    pub current: BucketState,
    /// Store attempts used, including the successful one.
    pub attempts: usize,
}

/// Atomic read-modify-write over a shared store.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Apply `transform` to the state under `key` as one linearizable step.
    ///
    /// The transform may run more than once when an optimistic attempt loses a race; it must
    /// be a pure function of its input.
    async fn get_and_update(
        &self,
        key: &str,
        ttl: Duration,
        transform: &(dyn Fn(Option<BucketState>) -> BucketState + Send + Sync),
    ) -> Result<Committed, StoreError>;
}

#[async_trait]
impl<S> BucketStore for Arc<S>
where
    S: BucketStore + ?Sized,
{
    async fn get_and_update(
        &self,
        key: &str,
        ttl: Duration,
        transform: &(dyn Fn(Option<BucketState>) -> BucketState + Send + Sync),
    ) -> Result<Committed, StoreError> {
        (**self).get_and_update(key, ttl, transform).await
    }
}

/// Retry and deadline settings shared by store adapters.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    call_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl AdapterConfig {
    /// Construct a new builder with defaults.
    pub fn builder() -> AdapterConfigBuilder {
        AdapterConfigBuilder::new()
    }

    /// Total store attempts per atomic update (initial + retries).
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Deadline applied to each attempt.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Wait before `attempt` (0-based); a no-op for the first attempt.
    pub async fn pause_before(&self, attempt: usize) {
        if attempt == 0 {
            return;
        }
        let delay = self.jitter.apply(self.backoff.delay(attempt));
        self.sleeper.sleep(delay).await;
    }

    /// Timeout wrapper for a single store round trip.
    pub fn deadline(&self) -> TimeoutPolicy {
        TimeoutPolicy::new(self.call_timeout)
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfigBuilder::new().into_config()
    }
}

/// Errors produced while building an [`AdapterConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    /// Store calls need a finite, non-zero deadline.
    #[error("call_timeout must be non-zero and finite")]
    InvalidTimeout,
}

/// Builder for [`AdapterConfig`].
#[derive(Debug, Clone)]
pub struct AdapterConfigBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    call_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl AdapterConfigBuilder {
    /// 5 attempts, 5ms exponential backoff capped at 100ms, full jitter, 250ms per call.
    pub fn new() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
            jitter: Jitter::Full,
            call_timeout: Duration::from_millis(250),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deadline for each store attempt.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the configuration, validating inputs.
    pub fn build(self) -> Result<AdapterConfig, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        if self.call_timeout.is_zero() || self.call_timeout == Duration::MAX {
            return Err(BuildError::InvalidTimeout);
        }
        Ok(self.into_config())
    }

    fn into_config(self) -> AdapterConfig {
        AdapterConfig {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            call_timeout: self.call_timeout,
            sleeper: self.sleeper,
        }
    }
}

impl Default for AdapterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// [`BucketStore`] built from a [`VersionedStore`] with a bounded compare-and-swap loop.
#[derive(Debug, Clone)]
pub struct CasStore<S> {
    inner: S,
    config: AdapterConfig,
}

impl<S> CasStore<S>
where
    S: VersionedStore,
{
    /// Wrap a backend with the default adapter configuration.
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, AdapterConfig::default())
    }

    pub fn with_config(inner: S, config: AdapterConfig) -> Self {
        Self { inner, config }
    }

    /// Borrow the wrapped backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// One optimistic attempt; `Ok(None)` means the write lost a race.
    async fn attempt(
        &self,
        key: &str,
        ttl: Duration,
        transform: &(dyn Fn(Option<BucketState>) -> BucketState + Send + Sync),
    ) -> Result<Option<(Option<BucketState>, BucketState)>, StoreError> {
        let (previous, version) = match self.inner.load(key).await? {
            Some(Versioned { state, version }) => {
                check_state(key, &state)?;
                (Some(state), Some(version))
            }
            None => (None, None),
        };
        let next = transform(previous);
        if self.inner.compare_and_swap(key, version.as_ref(), &next, ttl).await? {
            Ok(Some((previous, next)))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl<S> BucketStore for CasStore<S>
where
    S: VersionedStore,
{
    async fn get_and_update(
        &self,
        key: &str,
        ttl: Duration,
        transform: &(dyn Fn(Option<BucketState>) -> BucketState + Send + Sync),
    ) -> Result<Committed, StoreError> {
        let deadline = self.config.deadline();
        let mut last_failure = None;

        for attempt in 0..self.config.max_attempts {
            self.config.pause_before(attempt).await;

            match deadline.execute(self.attempt(key, ttl, transform)).await {
                Ok(Some((previous, current))) => {
                    return Ok(Committed { previous, current, attempts: attempt + 1 });
                }
                Ok(None) => {
                    tracing::debug!(target: "tollgate::store", key, attempt = attempt + 1, "compare-and-swap conflict");
                    last_failure = None;
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(target: "tollgate::store", key, attempt = attempt + 1, error = %err, "store attempt failed");
                    last_failure = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_failure.unwrap_or(StoreError::Contended { attempts: self.config.max_attempts }))
    }
}

fn check_state(key: &str, state: &BucketState) -> Result<(), StoreError> {
    if !state.tokens.is_finite() || state.tokens < 0.0 || !state.last_refill.is_finite() {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            detail: format!("tokens={} last_refill={}", state.tokens, state.last_refill),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::memory::InMemoryStore;
    use crate::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(60);

    /// Loses the first `conflicts` CAS races, then defers to an in-memory store.
    #[derive(Debug, Default)]
    struct RacyStore {
        conflicts: AtomicUsize,
        failures: AtomicUsize,
        inner: InMemoryStore,
    }

    #[async_trait]
    impl VersionedStore for RacyStore {
        type Version = u64;

        async fn load(&self, key: &str) -> Result<Option<Versioned<u64>>, StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::backend("connection reset"));
            }
            self.inner.load(key).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&u64>,
            next: &BucketState,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.compare_and_swap(key, expected, next, ttl).await
        }
    }

    fn config(max_attempts: usize) -> AdapterConfig {
        AdapterConfig::builder()
            .max_attempts(max_attempts)
            .with_jitter(Jitter::None)
            .backoff(Backoff::linear(Duration::from_millis(10)))
            .with_sleeper(InstantSleeper)
            .build()
            .expect("config")
    }

    fn decrement(prior: Option<BucketState>) -> BucketState {
        let s = prior.unwrap_or(BucketState { tokens: 3.0, last_refill: 10.0 });
        BucketState { tokens: s.tokens - 1.0, ..s }
    }

    #[tokio::test]
    async fn first_write_commits_in_one_attempt() {
        let store = CasStore::with_config(InMemoryStore::new(), config(3));
        let committed = store.get_and_update("a", TTL, &decrement).await.unwrap();
        assert_eq!(committed.previous, None);
        assert_eq!(committed.current.tokens, 2.0);
        assert_eq!(committed.attempts, 1);

        let again = store.get_and_update("a", TTL, &decrement).await.unwrap();
        assert_eq!(again.previous.map(|s| s.tokens), Some(2.0));
        assert_eq!(again.current.tokens, 1.0);
    }

    #[tokio::test]
    async fn conflicts_are_retried_with_backoff() {
        let sleeper = TrackingSleeper::new();
        let cfg = AdapterConfig::builder()
            .max_attempts(4)
            .with_jitter(Jitter::None)
            .backoff(Backoff::linear(Duration::from_millis(10)))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let racy = RacyStore { conflicts: AtomicUsize::new(2), ..Default::default() };
        let store = CasStore::with_config(racy, cfg);

        let committed = store.get_and_update("k", TTL, &decrement).await.unwrap();
        assert_eq!(committed.attempts, 3);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(10), Duration::from_millis(20)]);
    }

    #[tokio::test]
    async fn exhausted_conflicts_surface_as_contended() {
        let racy = RacyStore { conflicts: AtomicUsize::new(10), ..Default::default() };
        let store = CasStore::with_config(racy, config(3));
        let err = store.get_and_update("k", TTL, &decrement).await.unwrap_err();
        assert_eq!(err, StoreError::Contended { attempts: 3 });
        // Nothing was written.
        assert!(store.inner().inner.load("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_then_reported() {
        let racy = RacyStore { failures: AtomicUsize::new(1), ..Default::default() };
        let store = CasStore::with_config(racy, config(2));
        assert!(store.get_and_update("k", TTL, &decrement).await.is_ok());

        let failing = RacyStore { failures: AtomicUsize::new(5), ..Default::default() };
        let store = CasStore::with_config(failing, config(2));
        let err = store.get_and_update("k", TTL, &decrement).await.unwrap_err();
        assert_eq!(err, StoreError::Backend("connection reset".into()));
    }

    #[tokio::test]
    async fn corrupt_state_is_not_retried() {
        let inner = InMemoryStore::new();
        inner.insert("k", BucketState { tokens: f64::NAN, last_refill: 1.0 }, TTL);
        let store = CasStore::with_config(inner, config(5));
        let err = store.get_and_update("k", TTL, &decrement).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn builder_validates() {
        assert_eq!(
            AdapterConfig::builder().max_attempts(0).build().unwrap_err(),
            BuildError::InvalidMaxAttempts(0)
        );
        assert_eq!(
            AdapterConfig::builder().call_timeout(Duration::ZERO).build().unwrap_err(),
            BuildError::InvalidTimeout
        );
        let defaults = AdapterConfig::default();
        assert_eq!(defaults.max_attempts(), 5);
        assert_eq!(defaults.call_timeout(), Duration::from_millis(250));
    }
}
