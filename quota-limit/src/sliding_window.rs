use std::time::SystemTime;

use async_trait::async_trait;

use crate::decision::Decision;
use crate::epoch_millis;
use crate::key::QuotaKey;
use crate::limiter::AtomicLimiter;
use crate::limiter::Backend;
use crate::policy::Algorithm;
use crate::policy::Policy;
use crate::store::SlidingWindowRequest;
use crate::store::StoreReply;

const EXPIRY_GRACE_MS: u64 = 10_000;

/// A log of recorded costs per key, pruned on every access.
///
/// Two limits apply. The burst capacity is a hard cap over the trailing
/// window. Between the sustained limit (`rate * window`) and the hard cap
/// requests are still admitted but carry a penalty `retry_after`, unless the
/// policy asks for a strict sustained limit.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    backend: Backend,
}

impl SlidingWindow {
    pub(crate) fn with_backend(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl AtomicLimiter for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn check(&self, key: &QuotaKey, policy: &Policy, now: SystemTime) -> Decision {
        let request = request(policy, epoch_millis(now), rand::random());
        let store_key = format!("sw:{key}");

        let reply = self
            .backend
            .execute(self.backend.store().sliding_window(&store_key, &request))
            .await;

        match reply {
            Ok(reply) => Decision::from_reply(reply, self.algorithm(), key, policy, now),
            Err(err) => self.backend.failure(key, self.algorithm(), err, now),
        }
    }
}

pub(crate) fn request(policy: &Policy, now_ms: u64, nonce: u64) -> SlidingWindowRequest {
    let window_ms = policy.window_size().as_millis() as u64;
    let rate = policy.requests_per_second() as u64;
    SlidingWindowRequest {
        now_ms,
        window_ms,
        sub_window_ms: (policy.sub_window_duration().as_millis() as u64).max(1),
        rate_per_second: rate,
        capacity: policy.burst_capacity() as u64,
        sustained_limit: rate * window_ms / 1_000,
        cost: policy.tokens_per_request() as u64,
        strict: policy.strict_sustained_limit(),
        nonce,
        ttl_ms: window_ms + EXPIRY_GRACE_MS,
    }
}

/// One recorded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogEntry {
    pub(crate) at_ms: u64,
    pub(crate) cost: u64,
}

/// Prunes `log`, evaluates both limits and records the request if admitted.
///
/// `log` is kept ordered by timestamp.
pub(crate) fn apply(log: &mut Vec<LogEntry>, request: &SlidingWindowRequest) -> StoreReply {
    let horizon = request
        .now_ms
        .saturating_sub(request.window_ms + request.sub_window_ms);
    log.retain(|entry| entry.at_ms >= horizon);

    let window_start = request.now_ms.saturating_sub(request.window_ms);
    let mut total = 0;
    let mut oldest = None;
    for entry in log.iter().filter(|entry| entry.at_ms >= window_start) {
        total += entry.cost;
        oldest.get_or_insert(entry.at_ms);
    }

    if total + request.cost > request.capacity {
        let retry_after_ms = match oldest {
            Some(oldest) => (oldest + request.window_ms)
                .saturating_sub(request.now_ms)
                .max(1),
            None => request.window_ms,
        };
        return StoreReply {
            allowed: false,
            remaining: request.capacity.saturating_sub(total) as i64,
            retry_after_ms,
            total,
        };
    }

    let mut penalty_ms = 0;
    if total + request.cost > request.sustained_limit {
        let overage = total + request.cost - request.sustained_limit;
        penalty_ms = (overage * 1_000).div_ceil(request.rate_per_second);
        if request.strict {
            return StoreReply {
                allowed: false,
                remaining: (request.capacity - total) as i64,
                retry_after_ms: penalty_ms,
                total,
            };
        }
    }

    let position = log.partition_point(|entry| entry.at_ms <= request.now_ms);
    log.insert(
        position,
        LogEntry {
            at_ms: request.now_ms,
            cost: request.cost,
        },
    );

    StoreReply {
        allowed: true,
        remaining: (request.capacity - total - request.cost) as i64,
        retry_after_ms: penalty_ms,
        total: total + request.cost,
    }
}
