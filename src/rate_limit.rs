//! Per-key rate limiting with a pair of greedy-refill token buckets.
//!
//! Every key carries a per-second and a per-day bucket; an admitted request
//! costs one token from each. Buckets are created on first reference and
//! replaced when the key's plan limits change.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::KeyLimits;
use crate::time_source::TimeSource;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_DAY: u64 = 86_400 * NANOS_PER_SECOND;

struct TokenBucket {
    capacity: f64,
    refill_per_nano: f64,
    tokens: f64,
    last_refill_nanos: u64,
}

impl TokenBucket {
    fn new(capacity: u32, window_nanos: u64, now_nanos: u64) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            refill_per_nano: capacity / window_nanos as f64,
            tokens: capacity,
            last_refill_nanos: now_nanos,
        }
    }

    fn refill(&mut self, now_nanos: u64) {
        let elapsed = now_nanos.saturating_sub(self.last_refill_nanos);
        self.tokens =
            (self.tokens + elapsed as f64 * self.refill_per_nano).min(self.capacity);
        self.last_refill_nanos = now_nanos;
    }

    /// Nanoseconds until one full token is available; 0 if one already is.
    fn nanos_until_one(&self) -> u64 {
        if self.tokens >= 1.0 {
            return 0;
        }
        ((1.0 - self.tokens) / self.refill_per_nano).ceil() as u64
    }
}

struct BucketPair {
    limits: KeyLimits,
    second: TokenBucket,
    day: TokenBucket,
}

impl BucketPair {
    fn new(limits: KeyLimits, now_nanos: u64) -> Self {
        Self {
            limits,
            second: TokenBucket::new(
                limits.requests_per_second,
                NANOS_PER_SECOND,
                now_nanos,
            ),
            day: TokenBucket::new(limits.requests_per_day, NANOS_PER_DAY, now_nanos),
        }
    }
}

/// Outcome of one consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        /// Minimum remaining tokens across both buckets, post-consumption.
        remaining: u64,
    },
    Denied {
        /// Whole seconds until a token is available, at least 1.
        retry_after_secs: u64,
    },
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Mutex<BucketPair>>>>,
    time: Arc<dyn TimeSource>,
}

impl RateLimiter {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            time,
        }
    }

    /// Consume one token from both of the key's buckets, or deny.
    ///
    /// The pair is rebuilt when `limits` differs from the pair it was built
    /// with, which discards accumulated state after a plan change.
    pub async fn try_consume(&self, api_key: &str, limits: KeyLimits) -> RateDecision {
        let now = self.time.monotonic_nanos();

        let pair = {
            let mut buckets = self.buckets.lock().await;
            let existing = match buckets.get(api_key) {
                Some(pair) => {
                    let built_with = pair.lock().await.limits;
                    (built_with == limits).then(|| pair.clone())
                }
                None => None,
            };
            match existing {
                Some(pair) => pair,
                None => {
                    let fresh = Arc::new(Mutex::new(BucketPair::new(limits, now)));
                    buckets.insert(api_key.to_string(), fresh.clone());
                    fresh
                }
            }
        };

        let mut pair = pair.lock().await;
        pair.second.refill(now);
        pair.day.refill(now);

        if pair.second.tokens >= 1.0 && pair.day.tokens >= 1.0 {
            pair.second.tokens -= 1.0;
            pair.day.tokens -= 1.0;
            let remaining = pair.second.tokens.min(pair.day.tokens).floor() as u64;
            RateDecision::Allowed { remaining }
        } else {
            let wait_nanos = pair
                .second
                .nanos_until_one()
                .max(pair.day.nanos_until_one());
            let retry_after_secs =
                ((wait_nanos + NANOS_PER_SECOND - 1) / NANOS_PER_SECOND).max(1);
            RateDecision::Denied { retry_after_secs }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::ManualTimeSource;

    fn limiter() -> (Arc<ManualTimeSource>, RateLimiter) {
        let time = Arc::new(ManualTimeSource::new());
        let limiter = RateLimiter::new(time.clone());
        (time, limiter)
    }

    fn limits(rps: u32, rpd: u32) -> KeyLimits {
        KeyLimits {
            requests_per_second: rps,
            requests_per_day: rpd,
        }
    }

    #[tokio::test]
    async fn five_per_second_then_denied() {
        let (_, limiter) = limiter();
        let l = limits(5, 1_000_000);

        for _ in 0..5 {
            assert!(matches!(
                limiter.try_consume("sk_a", l).await,
                RateDecision::Allowed { .. }
            ));
        }

        match limiter.try_consume("sk_a", l).await {
            RateDecision::Denied { retry_after_secs } => {
                assert!((1..=2).contains(&retry_after_secs));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refills_after_1100_ms() {
        let (time, limiter) = limiter();
        let l = limits(5, 1_000_000);

        for _ in 0..5 {
            limiter.try_consume("sk_a", l).await;
        }
        assert!(matches!(
            limiter.try_consume("sk_a", l).await,
            RateDecision::Denied { .. }
        ));

        time.advance_millis(1100);
        assert!(matches!(
            limiter.try_consume("sk_a", l).await,
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn day_bucket_outlasts_second_bucket() {
        let (time, limiter) = limiter();
        let l = limits(10, 3);

        for _ in 0..3 {
            assert!(matches!(
                limiter.try_consume("sk_a", l).await,
                RateDecision::Allowed { .. }
            ));
        }

        // Second bucket refills fast, the day bucket does not.
        time.advance_millis(2000);
        match limiter.try_consume("sk_a", l).await {
            RateDecision::Denied { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn remaining_reports_minimum_of_both_buckets() {
        let (_, limiter) = limiter();
        let l = limits(100, 5);

        match limiter.try_consume("sk_a", l).await {
            RateDecision::Allowed { remaining } => assert_eq!(remaining, 4),
            other => panic!("expected allowance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn plan_change_discards_old_buckets() {
        let (_, limiter) = limiter();

        let old = limits(1, 1_000_000);
        assert!(matches!(
            limiter.try_consume("sk_a", old).await,
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.try_consume("sk_a", old).await,
            RateDecision::Denied { .. }
        ));

        // The forced cache reload hands the limiter fresh limits.
        let new = limits(10, 1_000_000);
        assert!(matches!(
            limiter.try_consume("sk_a", new).await,
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (_, limiter) = limiter();
        let l = limits(1, 1_000_000);

        assert!(matches!(
            limiter.try_consume("sk_a", l).await,
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.try_consume("sk_b", l).await,
            RateDecision::Allowed { .. }
        ));
    }
}
