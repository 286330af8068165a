mod common;

use async_trait::async_trait;
use common::{init_tracing, memory_limiter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::{
    AdmissionError, AdmissionLayer, Decision, DynamicConfig, FailureMode, LimiterError,
    ManualClock, Policy, RateLimiter, StoreError,
};
use tower::{service_fn, ServiceExt};
use tower_layer::Layer;

#[derive(Debug, Clone)]
struct Request {
    peer: &'static str,
}

fn by_peer(req: &Request) -> String {
    req.peer.to_string()
}

/// Limiter whose store is always down.
struct Unreachable;

#[async_trait]
impl RateLimiter for Unreachable {
    async fn evaluate(&self, _client_id: &str, _policy: &Policy) -> Result<Decision, LimiterError> {
        Err(LimiterError::StoreUnavailable(StoreError::Timeout {
            elapsed: Duration::from_millis(250),
            timeout: Duration::from_millis(250),
        }))
    }
}

fn counting_handler(
    hits: Arc<AtomicUsize>,
) -> impl tower::Service<Request, Response = &'static str, Error = std::io::Error, Future = impl Send>
       + Clone
       + Send
       + 'static {
    service_fn(move |_req: Request| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>("ok")
        }
    })
}

#[tokio::test]
async fn denied_requests_never_reach_the_handler() {
    let clock = ManualClock::default();
    let hits = Arc::new(AtomicUsize::new(0));
    let layer = AdmissionLayer::new(memory_limiter(&clock, 5), Policy::new(1.0, 2).unwrap(), by_peer);
    let svc = layer.layer(counting_handler(hits.clone()));

    for _ in 0..2 {
        let resp = svc.clone().oneshot(Request { peer: "10.0.0.1" }).await.unwrap();
        assert_eq!(resp, "ok");
    }
    let err = svc.clone().oneshot(Request { peer: "10.0.0.1" }).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
    assert_eq!(err.retry_after_header(), Some(1));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Another peer has its own bucket.
    svc.clone().oneshot(Request { peer: "10.0.0.2" }).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn store_failure_fails_closed_by_default() {
    init_tracing();
    let hits = Arc::new(AtomicUsize::new(0));
    let layer = AdmissionLayer::new(Unreachable, Policy::new(1.0, 1).unwrap(), by_peer);
    let svc = layer.layer(counting_handler(hits.clone()));

    let err = svc.oneshot(Request { peer: "10.0.0.1" }).await.unwrap_err();
    assert!(err.is_unavailable());
    assert!(matches!(err, AdmissionError::Unavailable(StoreError::Timeout { .. })));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_failure_can_fail_open() {
    init_tracing();
    let hits = Arc::new(AtomicUsize::new(0));
    let layer = AdmissionLayer::new(Unreachable, Policy::new(1.0, 1).unwrap(), by_peer)
        .failure_mode(FailureMode::Open);
    let svc = layer.layer(counting_handler(hits.clone()));

    assert_eq!(svc.oneshot(Request { peer: "10.0.0.1" }).await.unwrap(), "ok");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn misconfiguration_is_never_admitted() {
    let clock = ManualClock::default();
    let hits = Arc::new(AtomicUsize::new(0));
    let layer = AdmissionLayer::new(memory_limiter(&clock, 5), Policy::new(1.0, 1).unwrap(), |_: &Request| {
        String::new()
    })
    .failure_mode(FailureMode::Open);
    let svc = layer.layer(counting_handler(hits.clone()));

    let err = svc.oneshot(Request { peer: "10.0.0.1" }).await.unwrap_err();
    assert!(matches!(err, AdmissionError::Misconfigured(LimiterError::InvalidClientId)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn policy_can_be_retuned_live() {
    let clock = ManualClock::default();
    let hits = Arc::new(AtomicUsize::new(0));
    let policy = DynamicConfig::new(Policy::new(1.0, 1).unwrap());
    let layer = AdmissionLayer::with_live_policy(memory_limiter(&clock, 5), policy.clone(), by_peer);
    let svc = layer.layer(counting_handler(hits.clone()));

    svc.clone().oneshot(Request { peer: "a" }).await.unwrap();
    assert!(svc.clone().oneshot(Request { peer: "a" }).await.unwrap_err().is_rate_limited());

    // Faster refill takes effect on the next request.
    policy.set(Policy::new(10.0, 1).unwrap());
    clock.advance(Duration::from_millis(150));
    svc.clone().oneshot(Request { peer: "a" }).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(layer.policy_handle().get().rate, 10.0);
}
