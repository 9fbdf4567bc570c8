use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use crate::decision::Decision;
use crate::epoch_millis;
use crate::key::QuotaKey;
use crate::limiter::AtomicLimiter;
use crate::limiter::Backend;
use crate::policy::Algorithm;
use crate::policy::Policy;
use crate::store::FixedWindowRequest;
use crate::store::StoreReply;

/// How long a window counter outlives its window.
const EXPIRY_GRACE_MS: u64 = 60_000;

/// A counter per `(key, window start)` pair.
///
/// Divides time into fixed intervals. It is the cheapest strategy but can
/// be susceptible to "boundary bursts" where double the limit is allowed in
/// a short period spanning two windows.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    backend: Backend,
}

impl FixedWindow {
    pub(crate) fn with_backend(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl AtomicLimiter for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn check(&self, key: &QuotaKey, policy: &Policy, now: SystemTime) -> Decision {
        let request = request(policy, epoch_millis(now));
        let store_key = format!("fw:{key}:{}", request.window_start_ms);

        let reply = self
            .backend
            .execute(self.backend.store().fixed_window(&store_key, &request))
            .await;

        match reply {
            Ok(reply) => {
                let reset = request.window_start_ms + request.window_ms;
                Decision::from_reply(reply, self.algorithm(), key, policy, now)
                    .with_window_reset(UNIX_EPOCH + Duration::from_millis(reset))
            }
            Err(err) => self.backend.failure(key, self.algorithm(), err, now),
        }
    }
}

/// `min(burst, rate * window_seconds)`
pub(crate) fn window_limit(policy: &Policy) -> u64 {
    let window_ms = policy.window_size().as_millis() as u64;
    let sustained = policy.requests_per_second() as u64 * window_ms / 1_000;
    sustained.min(policy.burst_capacity() as u64)
}

pub(crate) fn request(policy: &Policy, now_ms: u64) -> FixedWindowRequest {
    let window_ms = policy.window_size().as_millis() as u64;
    FixedWindowRequest {
        now_ms,
        window_start_ms: now_ms / window_ms * window_ms,
        window_ms,
        limit: window_limit(policy),
        cost: policy.tokens_per_request() as u64,
        ttl_ms: window_ms + EXPIRY_GRACE_MS,
    }
}

/// Applies one check to the counter of a window; `None` is an empty window.
///
/// A denial leaves the counter untouched.
pub(crate) fn apply(
    current: Option<u64>,
    request: &FixedWindowRequest,
) -> (Option<u64>, StoreReply) {
    let count = current.unwrap_or_default();

    if count + request.cost > request.limit {
        let window_end = request.window_start_ms + request.window_ms;
        let reply = StoreReply {
            allowed: false,
            remaining: request.limit.saturating_sub(count) as i64,
            retry_after_ms: window_end.saturating_sub(request.now_ms).max(1),
            total: count,
        };
        return (current, reply);
    }

    let updated = count + request.cost;
    let reply = StoreReply {
        allowed: true,
        remaining: (request.limit - updated) as i64,
        retry_after_ms: 0,
        total: updated,
    };
    (Some(updated), reply)
}
