use std::sync::Arc;

use http::Request;
use http::Response;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::layer::util::Stack;
use tower::util::BoxCloneSyncService;

use quota_limit::QuotaEngine;

use crate::QuotaLayer;

/// Box `svc` behind the quota layer, with an optional named policy.
pub fn make_quota_svc<V, B, R>(
    engine: Arc<QuotaEngine>,
    policy: Option<&str>,
    svc: V,
) -> BoxCloneSyncService<Request<B>, Response<R>, BoxError>
where
    V: Service<Request<B>, Response = Response<R>> + Clone + Send + Sync + 'static,
    V::Error: Into<BoxError>,
    V::Future: Send,
    B: Send + 'static,
    R: Send + 'static,
{
    let mut layer = QuotaLayer::new(engine);
    if let Some(policy) = policy {
        layer = layer.with_policy(policy);
    }
    BoxCloneSyncService::new(ServiceBuilder::new().layer(layer).service(svc))
}

/// Service Builder Extension with additional useful functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Add a quota layer selecting policies by path
    fn quota_limit(self, engine: Arc<QuotaEngine>) -> ServiceBuilder<Stack<QuotaLayer, L>>;

    /// Add a quota layer enforcing one named policy
    fn named_quota_limit(
        self,
        engine: Arc<QuotaEngine>,
        policy: &str,
    ) -> ServiceBuilder<Stack<QuotaLayer, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn quota_limit(self, engine: Arc<QuotaEngine>) -> ServiceBuilder<Stack<QuotaLayer, L>> {
        self.layer(QuotaLayer::new(engine))
    }

    fn named_quota_limit(
        self,
        engine: Arc<QuotaEngine>,
        policy: &str,
    ) -> ServiceBuilder<Stack<QuotaLayer, L>> {
        self.layer(QuotaLayer::new(engine).with_policy(policy))
    }
}
