use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::SystemTime;

use futures::future::BoxFuture;
use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::Request;
use http::Response;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::BoxError;
use tower::Service;

use quota_limit::Decision;
use quota_limit::IdentityHeaders;
use quota_limit::PathPattern;
use quota_limit::QuotaEngine;
use quota_limit::RequestContext;

use crate::error::QuotaError;

#[derive(Clone, Debug)]
struct QuotaServiceMetrics {
    decisions: Counter<u64>,
}

impl QuotaServiceMetrics {
    fn record(&self, outcome: &'static str, algorithm: &'static str) {
        self.decisions.add(
            1,
            &[
                KeyValue::new("outcome", outcome),
                KeyValue::new("algorithm", algorithm),
            ],
        );
    }
}

fn outcome(decision: &Decision) -> &'static str {
    match (decision.allowed(), decision.is_error()) {
        (true, false) => "allowed",
        (false, false) => "denied",
        (true, true) => "failed_open",
        (false, true) => "failed_closed",
    }
}

/// Checks every request against the quota engine before it reaches `inner`.
///
/// Allowed requests are forwarded and their responses annotated with the
/// quota headers. Denied requests never reach `inner`; they fail with a
/// [`QuotaError`].
#[derive(Debug)]
pub struct QuotaService<S> {
    inner: S,
    engine: Arc<QuotaEngine>,
    policy: Option<Arc<str>>,
    skip_paths: Arc<[PathPattern]>,
    instruments: QuotaServiceMetrics,
}

impl<S> Clone for QuotaService<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: Arc::clone(&self.engine),
            policy: self.policy.clone(),
            skip_paths: Arc::clone(&self.skip_paths),
            instruments: self.instruments.clone(),
        }
    }
}

impl<S> QuotaService<S> {
    pub fn new(inner: S, engine: Arc<QuotaEngine>) -> Self {
        let meter = global::meter("quota_service");
        let instruments = QuotaServiceMetrics {
            decisions: meter.u64_counter("quota_decisions").build(),
        };

        Self {
            inner,
            engine,
            policy: None,
            skip_paths: Arc::from(Vec::new()),
            instruments,
        }
    }

    /// Check every request against the named policy instead of selecting
    /// one by path.
    pub fn with_policy(mut self, name: impl Into<Arc<str>>) -> Self {
        self.policy = Some(name.into());
        self
    }

    /// Requests whose path matches one of `patterns` bypass the quota.
    pub fn with_skip_paths(mut self, patterns: impl Into<Arc<[PathPattern]>>) -> Self {
        self.skip_paths = patterns.into();
        self
    }

    fn skipped(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|pattern| pattern.matches(path))
    }
}

impl<S, B, ResBody> Service<Request<B>> for QuotaService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    B: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Take the service that was driven to readiness and leave a clone
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.skipped(req.uri().path()) {
            tracing::trace!(path = %req.uri().path(), "quota skipped");
            return Box::pin(async move { inner.call(req).await.map_err(Into::into) });
        }

        let engine = Arc::clone(&self.engine);
        let policy = self.policy.clone();
        let instruments = self.instruments.clone();
        let ctx = request_context(&req, engine.resolver().headers());

        Box::pin(async move {
            let evaluation = engine
                .evaluate(&ctx, policy.as_deref(), SystemTime::now())
                .await;
            let decision = &evaluation.decision;
            instruments.record(outcome(decision), decision.algorithm());

            if !decision.allowed() {
                tracing::info!(
                    key = %evaluation.key,
                    method = %ctx.method,
                    path = %ctx.path,
                    retry_after = ?decision.retry_after(),
                    "request rejected by quota"
                );
                return Err(QuotaError::from_decision(decision, &ctx.path).into());
            }

            tracing::debug!(
                key = %evaluation.key,
                path = %ctx.path,
                remaining = decision.remaining_tokens(),
                "request admitted by quota"
            );
            let mut response = inner.call(req).await.map_err(Into::into)?;
            append_headers(response.headers_mut(), decision.headers());
            Ok(response)
        })
    }
}

/// The quota-relevant view of `req`.
///
/// Identity is read from the headers named in `headers`. The peer address
/// comes from a `SocketAddr` request extension, or from axum's
/// `ConnectInfo` when the `axum` feature is enabled.
pub fn request_context<B>(req: &Request<B>, headers: &IdentityHeaders) -> RequestContext {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    RequestContext {
        user_id: header(headers.user_id.as_str()),
        api_key: header(headers.api_key.as_str()),
        forwarded_for: header(headers.forwarded_for.as_str()),
        real_ip: header(headers.real_ip.as_str()),
        peer_addr: peer_addr(req).map(|addr| addr.ip()),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
    }
}

fn peer_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    #[cfg(feature = "axum")]
    if let Some(axum::extract::ConnectInfo(addr)) = req
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
    {
        return Some(*addr);
    }

    req.extensions().get::<SocketAddr>().copied()
}

pub(crate) fn append_headers(map: &mut HeaderMap, headers: &[(&'static str, String)]) {
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::warn!(header = *name, "dropping quota header with invalid value"),
        }
    }
}
