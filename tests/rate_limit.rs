mod common;

use common::memory_limiter;
use std::time::Duration;
use tollgate::rate_limit::bucket::transition;
use tollgate::{BucketState, Clock, Decision, LimiterError, ManualClock, Policy, RateLimiter};

#[tokio::test]
async fn ten_per_minute_scenario() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::per_period(10, Duration::from_secs(60)).expect("valid policy");

    for i in 0..10 {
        let decision = limiter.evaluate("198.51.100.4", &policy).await.unwrap();
        assert!(decision.is_admitted(), "request {} should be admitted", i + 1);
    }

    let denied = limiter.evaluate("198.51.100.4", &policy).await.unwrap();
    let wait = denied.retry_after_seconds().expect("11th request is denied");
    assert!((wait - 6.0).abs() < 1e-6, "retry_after was {}", wait);

    clock.advance(denied.retry_after().unwrap() + Duration::from_millis(1));
    assert!(limiter.evaluate("198.51.100.4", &policy).await.unwrap().is_admitted());
}

#[tokio::test]
async fn admissions_without_elapsed_time_never_exceed_capacity() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(2.0, 7).unwrap();

    let mut admitted = 0;
    for _ in 0..25 {
        if limiter.evaluate("c", &policy).await.unwrap().is_admitted() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 7);
}

#[test]
fn empty_bucket_refills_linearly_up_to_capacity() {
    let policy = Policy::new(0.25, 4).unwrap();
    let empty = BucketState { tokens: 0.0, last_refill: 1_000.0 };

    for (dt, expected) in [(0.0, 0.0), (2.0, 0.5), (8.0, 2.0), (16.0, 4.0), (400.0, 4.0)] {
        let step = transition(Some(&empty), 1_000.0 + dt, &policy);
        assert!((step.refilled - expected).abs() < 1e-9, "dt={} refilled={}", dt, step.refilled);
    }
}

#[tokio::test]
async fn repeated_denials_never_lower_tokens() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(0.1, 1).unwrap();

    limiter.evaluate("c", &policy).await.unwrap();
    clock.advance(Duration::from_secs(3));

    let mut previous = None;
    for _ in 0..5 {
        let decision = limiter.evaluate("c", &policy).await.unwrap();
        assert!(!decision.is_admitted());
        let tokens = limiter.store().inner().get("c").unwrap().tokens;
        if let Some(prev) = previous {
            assert_eq!(tokens, prev);
        }
        previous = Some(tokens);
    }
    assert!((previous.unwrap() - 0.3).abs() < 1e-6);
}

#[tokio::test]
async fn clients_are_isolated() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(1.0, 1).unwrap();

    assert!(limiter.evaluate("alice", &policy).await.unwrap().is_admitted());
    assert!(!limiter.evaluate("alice", &policy).await.unwrap().is_admitted());
    assert!(limiter.evaluate("bob", &policy).await.unwrap().is_admitted());
}

#[tokio::test]
async fn sub_second_rates_refill_smoothly() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(4.0, 1).unwrap();

    assert!(limiter.evaluate("c", &policy).await.unwrap().is_admitted());
    clock.advance(Duration::from_millis(100));
    let denied = limiter.evaluate("c", &policy).await.unwrap();
    let wait = denied.retry_after_seconds().unwrap();
    assert!((wait - 0.15).abs() < 1e-5, "retry_after was {}", wait);

    clock.advance(Duration::from_millis(151));
    assert!(limiter.evaluate("c", &policy).await.unwrap().is_admitted());
}

#[tokio::test]
async fn remaining_reports_tokens_left() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(1.0, 3).unwrap();

    let first = limiter.evaluate("c", &policy).await.unwrap();
    assert_eq!(first, Decision::Admitted { remaining: 2.0 });
    assert_eq!(first.remaining_whole(), 2);
}

#[tokio::test]
async fn stored_timestamp_tracks_latest_call() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(1.0, 2).unwrap();

    limiter.evaluate("c", &policy).await.unwrap();
    clock.advance(Duration::from_secs(5));
    limiter.evaluate("c", &policy).await.unwrap();
    let stored = limiter.store().inner().get("c").unwrap();
    assert_eq!(stored.last_refill, clock.now_secs());
    assert_eq!(stored.tokens, 1.0);
}

#[tokio::test]
async fn invalid_input_is_rejected() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);

    let nan_rate = Policy { rate: f64::NAN, capacity: 1 };
    assert!(matches!(
        limiter.evaluate("c", &nan_rate).await,
        Err(LimiterError::InvalidPolicy(_))
    ));
    let no_capacity = Policy { rate: 1.0, capacity: 0 };
    assert!(matches!(
        limiter.evaluate("c", &no_capacity).await,
        Err(LimiterError::InvalidPolicy(_))
    ));
    assert_eq!(
        limiter.evaluate("", &Policy::new(1.0, 1).unwrap()).await,
        Err(LimiterError::InvalidClientId)
    );
    assert!(limiter.store().inner().is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_buckets_expire_and_restart_full() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(1.0, 2).unwrap();

    limiter.evaluate("c", &policy).await.unwrap();
    limiter.evaluate("c", &policy).await.unwrap();
    assert_eq!(limiter.store().inner().get("c").unwrap().tokens, 0.0);

    // Idle TTL is two full refills (2 * 2s), with a one second floor.
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(limiter.store().inner().get("c").is_none());
    assert_eq!(limiter.store().inner().purge_expired(), 1);

    let decision = limiter.evaluate("c", &policy).await.unwrap();
    assert_eq!(decision, Decision::Admitted { remaining: 1.0 });
}

#[tokio::test(start_paused = true)]
async fn idle_clients_are_evicted_by_later_traffic() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let policy = Policy::new(1.0, 1).unwrap();

    for i in 0..2_000 {
        limiter.evaluate(&format!("10.1.{}.{}", i / 256, i % 256), &policy).await.unwrap();
    }
    assert_eq!(limiter.store().inner().len(), 2_000);

    tokio::time::advance(Duration::from_secs(3600)).await;
    clock.advance(Duration::from_secs(3600));
    limiter.evaluate("10.9.9.9", &policy).await.unwrap();
    assert_eq!(limiter.store().inner().len(), 1);
}

#[tokio::test]
async fn very_slow_policy_is_served() {
    let clock = ManualClock::default();
    let limiter = memory_limiter(&clock, 5);
    let glacial = Policy::new(1e-20, 1).expect("finite positive rate is valid");

    assert!(limiter.evaluate("c", &glacial).await.unwrap().is_admitted());
    let denied = limiter.evaluate("c", &glacial).await.unwrap();
    assert!(denied.retry_after().unwrap() > Duration::from_secs(365 * 24 * 3600));
}
