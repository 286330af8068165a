use crate::clock::{Clock, SystemClock};
use crate::error::LimiterError;
use crate::rate_limit::bucket::{transition, BucketState};
use crate::rate_limit::store::BucketStore;
use crate::rate_limit::{Decision, Policy, RateLimiter};
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink};
use async_trait::async_trait;
use std::sync::Arc;

/// Token bucket admission engine over a shared [`BucketStore`].
///
/// Stateless per call: everything client-specific lives in the store, so any number of
/// engine instances (threads, processes, hosts) can share one store. Each `evaluate` is a
/// single `get_and_update`; the decision is recomputed from the state the committed update
/// observed, so it always matches what was written.
pub struct TokenBucket<S, T = NullSink> {
    store: S,
    clock: Arc<dyn Clock>,
    sink: T,
    key_prefix: String,
    ttl_factor: u32,
}

impl<S, T> std::fmt::Debug for TokenBucket<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("clock", &self.clock)
            .field("key_prefix", &self.key_prefix)
            .field("ttl_factor", &self.ttl_factor)
            .field("store", &"<store>")
            .field("sink", &"<sink>")
            .finish()
    }
}

impl<S> TokenBucket<S, NullSink>
where
    S: BucketStore,
{
    /// Create an engine backed by `store`, using the system clock and no telemetry.
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: NullSink,
            key_prefix: String::new(),
            ttl_factor: 2,
        }
    }
}

impl<S, T> TokenBucket<S, T> {
    /// Replace the time source.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Send decision events to `sink`.
    pub fn with_sink<U>(self, sink: U) -> TokenBucket<S, U>
    where
        U: TelemetrySink,
    {
        TokenBucket {
            store: self.store,
            clock: self.clock,
            sink,
            key_prefix: self.key_prefix,
            ttl_factor: self.ttl_factor,
        }
    }

    /// Namespace store keys, e.g. `"ratelimit:"`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Idle buckets expire after `factor` full refill periods (default 2).
    pub fn with_ttl_factor(mut self, factor: u32) -> Self {
        self.ttl_factor = factor.max(1);
        self
    }

    pub fn ttl_factor(&self) -> u32 {
        self.ttl_factor
    }

    /// Store key for a client.
    pub fn key_for(&self, client_id: &str) -> String {
        format!("{}{}", self.key_prefix, client_id)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S, T> RateLimiter for TokenBucket<S, T>
where
    S: BucketStore,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn evaluate(&self, client_id: &str, policy: &Policy) -> Result<Decision, LimiterError> {
        policy.validate()?;
        if client_id.is_empty() {
            return Err(LimiterError::InvalidClientId);
        }

        let now = self.clock.now_secs();
        let key = self.key_for(client_id);
        let snapshot = *policy;
        let step = move |prior: Option<BucketState>| transition(prior.as_ref(), now, &snapshot).next;

        let committed =
            match self.store.get_and_update(&key, policy.idle_ttl(self.ttl_factor), &step).await {
                Ok(committed) => committed,
                Err(err) => {
                    tracing::warn!(target: "tollgate::engine", client_id, error = %err, "bucket update failed");
                    let event = LimiterEvent::StoreFailure {
                        client_id: client_id.to_string(),
                        error: err.to_string(),
                    };
                    emit_best_effort(self.sink.clone(), event).await;
                    return Err(err.into());
                }
            };

        let outcome = transition(committed.previous.as_ref(), now, policy);
        debug_assert_eq!(outcome.next, committed.current);

        if committed.attempts > 1 {
            let event = LimiterEvent::Contended {
                client_id: client_id.to_string(),
                attempts: committed.attempts,
            };
            emit_best_effort(self.sink.clone(), event).await;
        }

        let event = match &outcome.decision {
            Decision::Admitted { remaining } => {
                tracing::debug!(target: "tollgate::engine", client_id, remaining, "admitted");
                LimiterEvent::Admitted { client_id: client_id.to_string(), remaining: *remaining }
            }
            Decision::Denied { retry_after } => {
                tracing::debug!(target: "tollgate::engine", client_id, tokens = outcome.refilled, ?retry_after, "denied");
                LimiterEvent::Denied { client_id: client_id.to_string(), retry_after: *retry_after }
            }
        };
        emit_best_effort(self.sink.clone(), event).await;

        Ok(outcome.decision)
    }
}
