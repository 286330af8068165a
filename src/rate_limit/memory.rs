use crate::error::StoreError;
use crate::rate_limit::bucket::BucketState;
use crate::rate_limit::policy::MAX_IDLE_TTL;
use crate::rate_limit::store::{Versioned, VersionedStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    state: BucketState,
    version: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Buckets {
    entries: HashMap<String, Entry>,
    /// Earliest expiry among live entries, if known; a sweep is pointless before it.
    earliest_expiry: Option<Instant>,
    last_sweep: Option<Instant>,
}

impl Buckets {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.expires_at > now)
    }

    fn put(&mut self, key: String, entry: Entry) {
        self.earliest_expiry =
            Some(self.earliest_expiry.map_or(entry.expires_at, |t| t.min(entry.expires_at)));
        self.entries.insert(key, entry);
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        self.earliest_expiry = self.entries.values().map(|e| e.expires_at).min();
        self.last_sweep = Some(now);
        before - self.entries.len()
    }

    /// Sweep on the write path once something has expired, at most once per `interval`.
    fn maybe_sweep(&mut self, now: Instant, interval: Duration) {
        let due = self.earliest_expiry.is_some_and(|t| t <= now)
            && self.last_sweep.map_or(true, |last| now.duration_since(last) >= interval);
        if due {
            let removed = self.sweep(now);
            tracing::debug!(target: "tollgate::store", removed, remaining = self.entries.len(), "swept expired buckets");
        }
    }
}

/// Default minimum spacing between automatic sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// In-process [`VersionedStore`] for single-instance deployments and tests.
///
/// Versions come from one store-wide counter, so a key that expires and is recreated never
/// reuses a version an in-flight writer might still hold. The map lock is held only for a
/// single load or compare-and-swap, never across an await.
///
/// Expired buckets are removed by the write path itself: once the earliest known expiry has
/// passed, the next write sweeps the map, at most once per sweep interval. Memory is
/// therefore bounded by the clients active within one idle TTL.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    data: Arc<Mutex<Buckets>>,
    next_version: Arc<AtomicU64>,
    sweep_interval: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            data: Arc::default(),
            next_version: Arc::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum spacing between automatic sweeps of expired buckets.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Buckets>, StoreError> {
        self.data.lock().map_err(|_| StoreError::backend("in-memory store lock poisoned"))
    }

    fn lock_unpoisoned(&self) -> MutexGuard<'_, Buckets> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Unconditionally store `state` under `key`. Intended for seeding tests.
    pub fn insert(&self, key: impl Into<String>, state: BucketState, ttl: Duration) {
        let version = self.bump();
        let expires_at = deadline_after(Instant::now(), ttl);
        self.lock_unpoisoned().put(key.into(), Entry { state, version, expires_at });
    }

    /// Current state for `key`, ignoring expired entries.
    pub fn get(&self, key: &str) -> Option<BucketState> {
        self.lock_unpoisoned().live(key, Instant::now()).map(|e| e.state)
    }

    /// Drop expired entries now, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.lock_unpoisoned().sweep(Instant::now())
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.lock_unpoisoned().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `now + ttl`, saturating instead of overflowing `Instant`.
fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + MAX_IDLE_TTL)
}

#[async_trait]
impl VersionedStore for InMemoryStore {
    type Version = u64;

    async fn load(&self, key: &str) -> Result<Option<Versioned<u64>>, StoreError> {
        let guard = self.lock()?;
        Ok(guard
            .live(key, Instant::now())
            .map(|e| Versioned { state: e.state, version: e.version }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&u64>,
        next: &BucketState,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut guard = self.lock()?;
        let current = guard.live(key, now).map(|e| e.version);
        if current.as_ref() != expected {
            return Ok(false);
        }
        guard.maybe_sweep(now, self.sweep_interval);
        let version = self.bump();
        guard.put(
            key.to_string(),
            Entry { state: *next, version, expires_at: deadline_after(now, ttl) },
        );
        Ok(true)
    }
}
