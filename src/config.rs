//! Deserializable limiter settings.
//!
//! Loading the document (file, env, secret store) is the embedding service's job; this
//! module only defines its shape and turns it into validated runtime types.
//!
//! ```rust
//! use tollgate::config::LimiterSettings;
//!
//! let settings = LimiterSettings::from_json(r#"{
//!     "rate": 0.16666666666666666,
//!     "capacity": 10,
//!     "store": { "host": "redis.internal", "port": 6380 },
//!     "failure_mode": "open"
//! }"#).unwrap();
//! let policy = settings.policy().unwrap();
//! assert_eq!(policy.capacity, 10);
//!
//! let limiter = settings.token_bucket(tollgate::InMemoryStore::new()).unwrap();
//! let layer = settings.admission_layer(limiter, |peer: &String| peer.clone()).unwrap();
//! assert_eq!(layer.mode(), tollgate::FailureMode::Open);
//! ```

use crate::rate_limit::store::{AdapterConfig, BuildError, CasStore, VersionedStore};
use crate::rate_limit::{AdmissionLayer, FailureMode, Policy, TokenBucket};
use crate::{Backoff, BackoffError, PolicyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Errors raised while turning settings into runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Adapter(#[from] BuildError),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
}

/// Connection parameters for the shared store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
        }
    }
}

impl fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

/// Complete limiter settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Tokens per second.
    pub rate: f64,
    pub capacity: u32,
    pub store: StoreSettings,
    /// Deadline for each store attempt.
    pub call_timeout_ms: u64,
    /// Total store attempts per decision.
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Idle buckets expire after this many full refill periods.
    pub ttl_factor: u32,
    pub failure_mode: FailureMode,
    /// Prefix prepended to every client id in store keys.
    pub key_prefix: String,
}

impl Default for LimiterSettings {
    /// 10 requests per minute with a burst of 10, fail-closed.
    fn default() -> Self {
        Self {
            rate: 10.0 / 60.0,
            capacity: 10,
            store: StoreSettings::default(),
            call_timeout_ms: 250,
            max_attempts: 5,
            backoff_base_ms: 5,
            backoff_max_ms: 100,
            ttl_factor: 2,
            failure_mode: FailureMode::Closed,
            key_prefix: String::new(),
        }
    }
}

impl LimiterSettings {
    /// Parse a JSON settings document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Validated admission policy.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        Ok(Policy::new(self.rate, self.capacity)?)
    }

    /// Validated store adapter configuration (production sleeper, full jitter).
    pub fn adapter_config(&self) -> Result<AdapterConfig, ConfigError> {
        let backoff = Backoff::exponential(Duration::from_millis(self.backoff_base_ms))
            .with_max(Duration::from_millis(self.backoff_max_ms))?;
        Ok(AdapterConfig::builder()
            .max_attempts(self.max_attempts)
            .call_timeout(Duration::from_millis(self.call_timeout_ms))
            .backoff(backoff)
            .build()?)
    }

    /// Apply the key prefix and idle TTL factor to an engine.
    pub fn configure<S, T>(&self, engine: TokenBucket<S, T>) -> TokenBucket<S, T> {
        engine.with_key_prefix(self.key_prefix.clone()).with_ttl_factor(self.ttl_factor)
    }

    /// Engine over `store` with every store-side setting applied.
    pub fn token_bucket<V>(&self, store: V) -> Result<TokenBucket<CasStore<V>>, ConfigError>
    where
        V: VersionedStore,
    {
        let store = CasStore::with_config(store, self.adapter_config()?);
        Ok(self.configure(TokenBucket::new(store)))
    }

    /// Admission layer enforcing the configured policy and failure mode.
    pub fn admission_layer<L, K>(&self, limiter: L, key_fn: K) -> Result<AdmissionLayer<L, K>, ConfigError> {
        Ok(AdmissionLayer::new(limiter, self.policy()?, key_fn).failure_mode(self.failure_mode))
    }
}
