use std::time::SystemTime;

use async_trait::async_trait;

use crate::decision::Decision;
use crate::epoch_millis;
use crate::key::QuotaKey;
use crate::limiter::AtomicLimiter;
use crate::limiter::Backend;
use crate::policy::Algorithm;
use crate::policy::Policy;
use crate::store::StoreReply;
use crate::store::TokenBucketRequest;

/// Buckets refill well within this; expiry only collects idle keys.
const EXPIRY_MS: u64 = 3_600_000;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    backend: Backend,
}

impl TokenBucket {
    pub(crate) fn with_backend(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl AtomicLimiter for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn check(&self, key: &QuotaKey, policy: &Policy, now: SystemTime) -> Decision {
        let request = request(policy, epoch_millis(now));
        let store_key = format!("tb:{key}");

        let reply = self
            .backend
            .execute(self.backend.store().token_bucket(&store_key, &request))
            .await;

        match reply {
            Ok(reply) => Decision::from_reply(reply, self.algorithm(), key, policy, now),
            Err(err) => self.backend.failure(key, self.algorithm(), err, now),
        }
    }
}

pub(crate) fn request(policy: &Policy, now_ms: u64) -> TokenBucketRequest {
    TokenBucketRequest {
        now_ms,
        rate_per_second: policy.requests_per_second() as u64,
        capacity: policy.burst_capacity() as u64,
        cost: policy.tokens_per_request() as u64,
        ttl_ms: EXPIRY_MS,
    }
}

/// Persistent state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketState {
    pub(crate) tokens: u64,
    pub(crate) last_refill_ms: u64,
}

/// Refills the bucket for the time elapsed and tries to take the cost.
///
/// A missing bucket starts full. Every call, denied ones included, persists
/// the refilled tokens stamped with the call's time, so the refill is never
/// counted twice. A clock running behind the stored stamp refills nothing.
pub(crate) fn apply(
    state: Option<BucketState>,
    request: &TokenBucketRequest,
) -> (BucketState, StoreReply) {
    let BucketState {
        mut tokens,
        last_refill_ms,
    } = state.unwrap_or(BucketState {
        tokens: request.capacity,
        last_refill_ms: request.now_ms,
    });

    let elapsed = request.now_ms.saturating_sub(last_refill_ms);
    let refill = elapsed * request.rate_per_second / 1_000;
    tokens = (tokens + refill).min(request.capacity);
    let last_refill_ms = last_refill_ms.max(request.now_ms);

    let reply = if tokens < request.cost {
        StoreReply {
            allowed: false,
            remaining: tokens as i64,
            retry_after_ms: ((request.cost - tokens) * 1_000).div_ceil(request.rate_per_second),
            total: request.capacity - tokens,
        }
    } else {
        tokens -= request.cost;
        StoreReply {
            allowed: true,
            remaining: tokens as i64,
            retry_after_ms: 0,
            total: request.capacity - tokens,
        }
    };

    (
        BucketState {
            tokens,
            last_refill_ms,
        },
        reply,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use std::time::UNIX_EPOCH;

    use more_asserts::assert_ge;
    use more_asserts::assert_le;

    use crate::limiter::LimiterOptions;
    use crate::limiter::QuotaLimiter;
    use crate::policy::KeyStrategy;
    use crate::store::MemoryStore;

    use super::*;

    fn bucket_policy(rate: u32, burst: u32) -> Policy {
        Policy::builder()
            .requests_per_second(rate)
            .burst_capacity(burst)
            .algorithm(Algorithm::TokenBucket)
            .build()
            .unwrap()
    }

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn it_enforces_limits_starting_full() {
        let limiter = QuotaLimiter::new(Arc::new(MemoryStore::new()), LimiterOptions::default());
        let policy = bucket_policy(10, 20);
        let key = QuotaKey::new(KeyStrategy::PerUser, "alice");

        for expected in (0..20).rev() {
            let decision = limiter.check(&key, &policy, at(50_000)).await;
            assert!(decision.allowed());
            assert_eq!(decision.remaining_tokens(), expected);
            assert_eq!(decision.algorithm(), "token-bucket");
        }

        let denied = limiter.check(&key, &policy, at(50_000)).await;
        assert!(!denied.allowed());
        assert_eq!(denied.remaining_tokens(), 0);
        assert_eq!(denied.retry_after(), Duration::from_millis(100));
        assert_eq!(denied.reason(), Some(policy.denial_message()));

        // one refill interval later a single token is available
        assert!(limiter.check(&key, &policy, at(50_100)).await.allowed());
        assert!(!limiter.check(&key, &policy, at(50_100)).await.allowed());
    }

    #[test]
    fn test_refill_clock_restarts_on_every_call() {
        // 1 token every 100ms
        let request_at = |now_ms| TokenBucketRequest {
            now_ms,
            rate_per_second: 10,
            capacity: 10,
            cost: 1,
            ttl_ms: EXPIRY_MS,
        };
        let empty = BucketState {
            tokens: 0,
            last_refill_ms: 0,
        };

        // Each denial stamps the bucket with its own time
        let (state, reply) = apply(Some(empty), &request_at(30));
        assert!(!reply.allowed);
        assert_eq!(state.last_refill_ms, 30);
        let (state, reply) = apply(Some(state), &request_at(60));
        assert!(!reply.allowed);
        assert_eq!(state.last_refill_ms, 60);
        let (state, reply) = apply(Some(state), &request_at(90));
        assert!(!reply.allowed);
        assert_eq!(reply.retry_after_ms, 100);
        assert_eq!(state.last_refill_ms, 90);

        // 11ms since the last call is not a whole token
        let (state, reply) = apply(Some(state), &request_at(101));
        assert!(!reply.allowed);
        assert_eq!(state.tokens, 0);
        assert_eq!(state.last_refill_ms, 101);

        // a full interval after the last call refills one token
        let (state, reply) = apply(Some(state), &request_at(201));
        assert!(reply.allowed);
        assert_eq!(state.tokens, 0);
        assert_eq!(state.last_refill_ms, 201);
    }

    #[test]
    fn stale_clock_never_rewinds_the_bucket() {
        let state = BucketState {
            tokens: 3,
            last_refill_ms: 5_000,
        };
        let request = TokenBucketRequest {
            now_ms: 4_000,
            rate_per_second: 10,
            capacity: 10,
            cost: 1,
            ttl_ms: EXPIRY_MS,
        };
        let (after, reply) = apply(Some(state), &request);
        assert!(reply.allowed);
        assert_eq!(after.tokens, 2);
        assert_eq!(after.last_refill_ms, 5_000);
    }

    #[test]
    fn tokens_stay_within_capacity() {
        let mut state = None;
        let mut now_ms = 0;
        // a deterministic mix of idle gaps and bursts
        for step in 0..500u64 {
            now_ms += (step * 37) % 250;
            let request = TokenBucketRequest {
                now_ms,
                rate_per_second: 7,
                capacity: 15,
                cost: 1 + step % 3,
                ttl_ms: EXPIRY_MS,
            };
            let (next, reply) = apply(state, &request);
            assert_le!(next.tokens, 15);
            assert_ge!(reply.remaining, 0);
            assert_le!(next.last_refill_ms, now_ms);
            state = Some(next);
        }
    }

    #[test]
    fn retry_hint_grows_with_overage() {
        let state = BucketState {
            tokens: 2,
            last_refill_ms: 1_000,
        };
        let mut previous = 0;
        for cost in 3..40 {
            let request = TokenBucketRequest {
                now_ms: 1_000,
                rate_per_second: 3,
                capacity: 40,
                cost,
                ttl_ms: EXPIRY_MS,
            };
            let (after, reply) = apply(Some(state), &request);
            assert!(!reply.allowed);
            assert_eq!(after.tokens, 2);
            assert_ge!(reply.retry_after_ms, previous);
            previous = reply.retry_after_ms;
        }
    }

    #[test]
    fn idle_bucket_refills_to_capacity_only() {
        let state = BucketState {
            tokens: 1,
            last_refill_ms: 0,
        };
        let request = TokenBucketRequest {
            now_ms: 3_600_000,
            rate_per_second: 100,
            capacity: 200,
            cost: 1,
            ttl_ms: EXPIRY_MS,
        };
        let (after, reply) = apply(Some(state), &request);
        assert_eq!(after.tokens, 199);
        assert_eq!(after.last_refill_ms, 3_600_000);
        assert_eq!(reply.total, 1);
    }
}
