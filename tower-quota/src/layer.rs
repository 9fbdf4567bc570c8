use std::sync::Arc;

use quota_limit::PathPattern;
use quota_limit::QuotaEngine;
use tower::Layer;

use crate::service::QuotaService;

/// Applies quotas to requests.
#[derive(Debug)]
pub struct QuotaLayer {
    engine: Arc<QuotaEngine>,
    policy: Option<Arc<str>>,
    skip_paths: Arc<[PathPattern]>,
}

// Every service built by the layer shares the engine, and so the store.
impl Clone for QuotaLayer {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            policy: self.policy.clone(),
            skip_paths: Arc::clone(&self.skip_paths),
        }
    }
}

impl QuotaLayer {
    /// Create a QuotaLayer
    pub fn new(engine: Arc<QuotaEngine>) -> Self {
        QuotaLayer {
            engine,
            policy: None,
            skip_paths: Arc::from(Vec::new()),
        }
    }

    /// Check every request against the named policy.
    ///
    /// Unknown names fall back to selection by path.
    pub fn with_policy(mut self, name: impl Into<Arc<str>>) -> Self {
        self.policy = Some(name.into());
        self
    }

    /// Exempt requests whose path matches one of `patterns`, e.g. health
    /// checks.
    pub fn with_skip_paths(mut self, patterns: impl IntoIterator<Item = PathPattern>) -> Self {
        self.skip_paths = patterns.into_iter().collect();
        self
    }

    pub fn engine(&self) -> &Arc<QuotaEngine> {
        &self.engine
    }
}

impl<S> Layer<S> for QuotaLayer {
    type Service = QuotaService<S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = QuotaService::new(service, Arc::clone(&self.engine))
            .with_skip_paths(Arc::clone(&self.skip_paths));
        if let Some(policy) = &self.policy {
            svc = svc.with_policy(Arc::clone(policy));
        }
        svc
    }
}
