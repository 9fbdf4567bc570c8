use std::sync::Arc;
use std::time::SystemTime;

use crate::decision::Decision;
use crate::error::StoreError;
use crate::key::KeyResolver;
use crate::key::QuotaKey;
use crate::key::RequestContext;
use crate::limiter::LimiterOptions;
use crate::limiter::QuotaLimiter;
use crate::policy::Policy;
use crate::selector::PolicySelector;
use crate::store::MemoryStore;

/// The result of evaluating one request.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: Decision,
    pub policy: Arc<Policy>,
    pub key: QuotaKey,
}

/// Selects a policy, resolves the key and checks the quota for a request.
#[derive(Debug, Clone)]
pub struct QuotaEngine {
    selector: PolicySelector,
    resolver: KeyResolver,
    limiter: QuotaLimiter,
}

impl QuotaEngine {
    pub fn new(selector: PolicySelector, resolver: KeyResolver, limiter: QuotaLimiter) -> Self {
        Self {
            selector,
            resolver,
            limiter,
        }
    }

    /// The built-in policies over an in-process store.
    pub fn in_memory() -> Self {
        Self::new(
            PolicySelector::builtin(),
            KeyResolver::default(),
            QuotaLimiter::new(Arc::new(MemoryStore::new()), LimiterOptions::default()),
        )
    }

    pub fn selector(&self) -> &PolicySelector {
        &self.selector
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub fn limiter(&self) -> &QuotaLimiter {
        &self.limiter
    }

    /// `policy_name` selects a named policy ahead of any path override.
    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        policy_name: Option<&str>,
        now: SystemTime,
    ) -> Evaluation {
        let policy = self.selector.select(&ctx.path, policy_name);
        let key = self.resolver.resolve(ctx, policy.strategy());
        let decision = self.limiter.check(&key, &policy, now).await;

        tracing::debug!(
            method = %ctx.method,
            path = %ctx.path,
            details = %decision.technical_details(),
            "quota evaluated"
        );

        Evaluation {
            decision,
            policy,
            key,
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.limiter.ping().await
    }

    pub fn error_count(&self) -> u64 {
        self.limiter.error_count()
    }
}
