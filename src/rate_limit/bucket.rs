//! Token bucket state and the refill-on-read transition.
//!
//! [`transition`] is the whole admission algorithm as a pure function of the stored state,
//! the current time and the policy. Store adapters run it inside their atomic primitive;
//! the Redis script in `tollgate-redis` mirrors it line for line.

use super::policy::{secs_to_duration, Policy};
use super::Decision;

/// Per-client bucket as persisted in the shared store.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// Epoch seconds of the last update. Never moves backwards.
    pub last_refill: f64,
}

impl BucketState {
    /// A brand-new client starts with a full bucket.
    pub fn full(policy: &Policy, now: f64) -> Self {
        Self { tokens: policy.capacity_tokens(), last_refill: now }
    }

    /// Tokens this bucket would hold at `now`, without consuming any.
    pub fn refilled(&self, now: f64, policy: &Policy) -> f64 {
        let elapsed = (now - self.last_refill).max(0.0);
        (self.tokens + elapsed * policy.rate).min(policy.capacity_tokens())
    }
}

/// Outcome of one admission step.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Tokens after refill, before any consumption.
    pub refilled: f64,
    /// State to persist, written on denial as well so refill progress is kept.
    pub next: BucketState,
    pub decision: Decision,
}

/// Apply one request to `prior` at time `now`.
///
/// Missing state is synthesized as a full bucket. Elapsed time is clamped at zero, so a
/// caller whose clock runs behind the stored timestamp gets no refill and cannot pull the
/// stored timestamp backwards.
pub fn transition(prior: Option<&BucketState>, now: f64, policy: &Policy) -> Transition {
    let current = prior.copied().unwrap_or_else(|| BucketState::full(policy, now));
    let refilled = current.refilled(now, policy);
    let last_refill = current.last_refill.max(now);

    if refilled >= 1.0 {
        let remaining = refilled - 1.0;
        Transition {
            refilled,
            next: BucketState { tokens: remaining, last_refill },
            decision: Decision::Admitted { remaining },
        }
    } else {
        Transition {
            refilled,
            next: BucketState { tokens: refilled, last_refill },
            decision: Decision::Denied { retry_after: retry_after(refilled, policy) },
        }
    }
}

/// Time until `tokens` reaches one whole token at the policy's rate.
pub fn retry_after(tokens: f64, policy: &Policy) -> std::time::Duration {
    secs_to_duration((1.0 - tokens) / policy.rate)
}
