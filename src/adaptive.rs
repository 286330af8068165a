//! Live-updatable configuration handles.
//!
//! The admission layer reads its [`Policy`](crate::rate_limit::Policy) on every request and
//! operators may retune it at any time. Reads are lock-free through `ArcSwap` by default;
//! the `adaptive-rwlock` feature switches the backend to `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared, swappable value. Clones observe the same updates.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a handle holding `value`.
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
        }
    }

    /// Replace the value; in-flight readers keep their snapshot.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(value);
        }
    }

    /// Derive the next value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.get());
        self.set(next);
    }
}
