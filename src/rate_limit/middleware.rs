use crate::adaptive::DynamicConfig;
use crate::error::{LimiterError, StoreError};
use crate::rate_limit::{Decision, Policy, RateLimiter};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// What to do with a request when the shared store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum FailureMode {
    /// Admit the request; protection degrades, availability does not.
    Open,
    /// Reject the request as unavailable; availability degrades, protection does not.
    #[default]
    Closed,
}

/// Errors produced by [`AdmissionService`].
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// Denied; an HTTP stack answers 429 with `Retry-After`.
    RateLimited { retry_after: Duration },
    /// Store failure under [`FailureMode::Closed`]; an HTTP stack answers 503.
    Unavailable(StoreError),
    /// Invalid policy or client identity. Never admitted, whatever the failure mode.
    Misconfigured(LimiterError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E> AdmissionError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Retry hint for rate-limited requests.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// `Retry-After` header value: whole seconds, rounded up, at least 1.
    pub fn retry_after_header(&self) -> Option<u64> {
        self.retry_after().map(|d| (d.as_secs_f64().ceil() as u64).max(1))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after } => {
                write!(f, "too many requests; retry after {:?}", retry_after)
            }
            Self::Unavailable(e) => write!(f, "rate limiter unavailable: {}", e),
            Self::Misconfigured(e) => write!(f, "rate limiter misconfigured: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Unavailable(e) => Some(e),
            Self::Misconfigured(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

/// A layer that admits requests through a [`RateLimiter`].
///
/// `key_fn` maps each request to its client identity (peer address, API key, tenant);
/// identity policy stays with the caller. The policy is read from a [`DynamicConfig`] on
/// every request so it can be retuned live.
pub struct AdmissionLayer<L, K> {
    limiter: Arc<L>,
    policy: DynamicConfig<Policy>,
    key_fn: Arc<K>,
    failure_mode: FailureMode,
}

impl<L, K> Clone for AdmissionLayer<L, K> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
            key_fn: self.key_fn.clone(),
            failure_mode: self.failure_mode,
        }
    }
}

impl<L, K> fmt::Debug for AdmissionLayer<L, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("policy", &*self.policy.get())
            .field("failure_mode", &self.failure_mode)
            .finish()
    }
}

impl<L, K> AdmissionLayer<L, K> {
    /// Fixed policy, fail-closed.
    pub fn new(limiter: L, policy: Policy, key_fn: K) -> Self {
        Self::with_live_policy(limiter, DynamicConfig::new(policy), key_fn)
    }

    /// Policy read from a shared handle on every request.
    pub fn with_live_policy(limiter: L, policy: DynamicConfig<Policy>, key_fn: K) -> Self {
        Self {
            limiter: Arc::new(limiter),
            policy,
            key_fn: Arc::new(key_fn),
            failure_mode: FailureMode::Closed,
        }
    }

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Handle for retuning the policy at runtime.
    pub fn policy_handle(&self) -> DynamicConfig<Policy> {
        self.policy.clone()
    }
}

impl<S, L, K> Layer<S> for AdmissionLayer<L, K> {
    type Service = AdmissionService<S, L, K>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
            key_fn: self.key_fn.clone(),
            failure_mode: self.failure_mode,
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, L, K> {
    inner: S,
    limiter: Arc<L>,
    policy: DynamicConfig<Policy>,
    key_fn: Arc<K>,
    failure_mode: FailureMode,
}

impl<S: Clone, L, K> Clone for AdmissionService<S, L, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
            key_fn: self.key_fn.clone(),
            failure_mode: self.failure_mode,
        }
    }
}

impl<S, L, K, Req> Service<Req> for AdmissionService<S, L, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let client_id = (self.key_fn)(&req);
        let policy = self.policy.get();
        let limiter = self.limiter.clone();
        let failure_mode = self.failure_mode;
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.evaluate(&client_id, &policy).await {
                Ok(Decision::Admitted { .. }) => inner.call(req).await.map_err(AdmissionError::Inner),
                Ok(Decision::Denied { retry_after }) => Err(AdmissionError::RateLimited { retry_after }),
                Err(LimiterError::StoreUnavailable(err)) => match failure_mode {
                    FailureMode::Open => {
                        tracing::warn!(target: "tollgate::layer", client_id = %client_id, error = %err, "store unavailable, failing open");
                        inner.call(req).await.map_err(AdmissionError::Inner)
                    }
                    FailureMode::Closed => {
                        tracing::warn!(target: "tollgate::layer", client_id = %client_id, error = %err, "store unavailable, failing closed");
                        Err(AdmissionError::Unavailable(err))
                    }
                },
                Err(err) => {
                    tracing::error!(target: "tollgate::layer", client_id = %client_id, error = %err, "rate limiter misconfigured");
                    Err(AdmissionError::Misconfigured(err))
                }
            }
        })
    }
}
