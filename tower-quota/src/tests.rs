use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use async_trait::async_trait;
use futures::future::Ready;
use futures::future::join_all;
use futures::future::ready;
use http::Request;
use http::Response;
use http::StatusCode;
use quota_limit::Algorithm;
use quota_limit::KeyResolver;
use quota_limit::KeyStrategy;
use quota_limit::LimiterOptions;
use quota_limit::MemoryStore;
use quota_limit::PathPattern;
use quota_limit::Policy;
use quota_limit::PolicySelector;
use quota_limit::QuotaConfig;
use quota_limit::QuotaEngine;
use quota_limit::QuotaLimiter;
use quota_limit::QuotaStore;
use quota_limit::StoreError;
use quota_limit::presets;
use quota_limit::store::FixedWindowRequest;
use quota_limit::store::SlidingWindowRequest;
use quota_limit::store::StoreReply;
use quota_limit::store::TokenBucketRequest;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

#[derive(Clone)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl MockService {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Service<Request<()>> for MockService {
    type Response = Response<String>;
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(Response::new("ok".to_string())))
    }
}

#[derive(Debug)]
struct RefusingStore;

#[async_trait]
impl QuotaStore for RefusingStore {
    async fn fixed_window(
        &self,
        _key: &str,
        _request: &FixedWindowRequest,
    ) -> Result<StoreReply, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn token_bucket(
        &self,
        _key: &str,
        _request: &TokenBucketRequest,
    ) -> Result<StoreReply, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn sliding_window(
        &self,
        _key: &str,
        _request: &SlidingWindowRequest,
    ) -> Result<StoreReply, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

// One token per second, so nothing refills while a test runs
fn bucket_policy(burst: u32) -> Policy {
    Policy::builder()
        .requests_per_second(1)
        .burst_capacity(burst)
        .algorithm(Algorithm::TokenBucket)
        .build()
        .unwrap()
}

fn engine_with(
    policy: Policy,
    store: Arc<dyn QuotaStore>,
    options: LimiterOptions,
) -> Arc<QuotaEngine> {
    let selector = PolicySelector::new(policy)
        .unwrap()
        .with_named("batch", presets::batch_operations());
    Arc::new(QuotaEngine::new(
        selector,
        KeyResolver::default(),
        QuotaLimiter::new(store, options),
    ))
}

fn engine(policy: Policy) -> Arc<QuotaEngine> {
    engine_with(policy, Arc::new(MemoryStore::new()), LimiterOptions::default())
}

fn request(path: &str, user: Option<&str>) -> Request<()> {
    let mut builder = Request::builder().method("POST").uri(path);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(()).unwrap()
}

fn quota_error(err: BoxError) -> QuotaError {
    match err.downcast::<QuotaError>() {
        Ok(err) => *err,
        Err(err) => panic!("expected a quota error, got {err}"),
    }
}

#[tokio::test]
async fn test_allowed_response_carries_quota_headers() {
    let mock = MockService::new();
    let mut service = QuotaLayer::new(engine(bucket_policy(3))).layer(mock.clone());

    let response = service
        .ready()
        .await
        .unwrap()
        .call(request("/api/v1/portfolio", Some("alice")))
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "1");
    assert_eq!(headers["x-ratelimit-remaining"], "2");
    assert_eq!(headers["x-ratelimit-algorithm"], "token-bucket");
    assert_eq!(headers["x-ratelimit-window"], "60");
    assert_eq!(headers["x-ratelimit-status"], "allowed");
    assert!(!headers.contains_key("retry-after"));
    assert_eq!(mock.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_denied_request_never_reaches_inner() {
    let mock = MockService::new();
    let mut service = QuotaLayer::new(engine(bucket_policy(2))).layer(mock.clone());

    for _ in 0..2 {
        service
            .ready()
            .await
            .unwrap()
            .call(request("/api/v1/portfolio", Some("alice")))
            .await
            .unwrap();
    }

    let err = service
        .ready()
        .await
        .unwrap()
        .call(request("/api/v1/portfolio", Some("alice")))
        .await
        .unwrap_err();

    let err = quota_error(err);
    assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    let QuotaError::RateLimited { rejection, headers } = &err else {
        panic!("expected a rate limited error, got {err:?}");
    };
    assert_eq!(rejection.status, 429);
    assert_eq!(rejection.path, "/api/v1/portfolio");
    assert_eq!(rejection.rate_limit_details.retry_after_seconds, 1);
    assert_eq!(rejection.rate_limit_details.algorithm, "token-bucket");
    assert!(headers.contains(&("Retry-After", "1".to_string())));
    assert_eq!(mock.count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejection_renders_structured_body() {
    let mut service = QuotaLayer::new(engine(bucket_policy(1))).layer(MockService::new());

    service
        .ready()
        .await
        .unwrap()
        .call(request("/reports", Some("bob")))
        .await
        .unwrap();
    let err = service
        .ready()
        .await
        .unwrap()
        .call(request("/reports", Some("bob")))
        .await
        .unwrap_err();

    let response = quota_error(err).to_response();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.headers()["retry-after"], "1");
    assert_eq!(response.headers()["x-ratelimit-status"], "denied");

    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body["status"], 429);
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["path"], "/reports");
    assert_eq!(body["rateLimitDetails"]["remainingTokens"], 0);
    assert_eq!(body["rateLimitDetails"]["retryAfterSeconds"], 1);
    assert_eq!(body["rateLimitDetails"]["windowSize"], "1m");
    assert_eq!(body["rateLimitDetails"]["penaltyDuration"], "5m");
}

#[tokio::test]
async fn test_users_have_separate_quotas() {
    let mut service = QuotaLayer::new(engine(bucket_policy(1))).layer(MockService::new());

    let alice = service
        .ready()
        .await
        .unwrap()
        .call(request("/", Some("alice")))
        .await;
    let bob = service
        .ready()
        .await
        .unwrap()
        .call(request("/", Some("bob")))
        .await;
    let alice_again = service
        .ready()
        .await
        .unwrap()
        .call(request("/", Some("alice")))
        .await;

    assert!(alice.is_ok());
    assert!(bob.is_ok());
    assert!(alice_again.is_err());
}

#[tokio::test]
async fn test_peer_address_keys_anonymous_requests() {
    let policy = bucket_policy(1).with_strategy(KeyStrategy::PerIp).unwrap();
    let mut service = QuotaLayer::new(engine(policy)).layer(MockService::new());

    let from = |addr: &str| {
        let mut req = request("/", None);
        req.extensions_mut()
            .insert(addr.parse::<SocketAddr>().unwrap());
        req
    };

    assert!(service.ready().await.unwrap().call(from("192.0.2.1:4000")).await.is_ok());
    // another port of the same host shares the quota
    assert!(service.ready().await.unwrap().call(from("192.0.2.1:4001")).await.is_err());
    assert!(service.ready().await.unwrap().call(from("192.0.2.2:4000")).await.is_ok());
}

#[test]
fn test_request_context_reads_configured_headers() {
    let config = QuotaConfig::from_toml_str(
        r#"
[identity_headers]
user_id = "x-account"
"#,
    )
    .unwrap();

    let mut req = Request::builder()
        .method("GET")
        .uri("/api/v1/orders?page=2")
        .header("x-account", "acct-7")
        .header("x-user-id", "ignored")
        .header("x-forwarded-for", "198.51.100.7, 10.0.0.1")
        .body(())
        .unwrap();
    req.extensions_mut()
        .insert("127.0.0.1:9000".parse::<SocketAddr>().unwrap());

    let ctx = request_context(&req, &config.identity_headers);
    assert_eq!(ctx.user_id.as_deref(), Some("acct-7"));
    assert_eq!(ctx.forwarded_for.as_deref(), Some("198.51.100.7, 10.0.0.1"));
    assert_eq!(ctx.api_key, None);
    assert_eq!(ctx.method, "GET");
    assert_eq!(ctx.path, "/api/v1/orders");
    assert_eq!(ctx.peer_addr, Some("127.0.0.1".parse().unwrap()));
}

#[tokio::test]
async fn test_skip_paths_bypass_the_quota() {
    let mock = MockService::new();
    let layer = QuotaLayer::new(engine(bucket_policy(1)))
        .with_skip_paths([PathPattern::parse("/health/**").unwrap()]);
    let mut service = layer.layer(mock.clone());

    for _ in 0..5 {
        let response = service
            .ready()
            .await
            .unwrap()
            .call(request("/health/live", Some("monitor")))
            .await
            .unwrap();
        assert!(!response.headers().contains_key("x-ratelimit-remaining"));
    }
    assert_eq!(mock.count.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_named_policy_overrides_path_selection() {
    let mut service = ServiceBuilder::new()
        .named_quota_limit(engine(bucket_policy(3)), "batch")
        .service(MockService::new());

    let response = service
        .ready()
        .await
        .unwrap()
        .call(request("/api/v1/import", Some("etl")))
        .await
        .unwrap();
    assert_eq!(response.headers()["x-ratelimit-algorithm"], "fixed-window");
}

#[tokio::test]
async fn test_shared_state_across_clones() {
    let layer = QuotaLayer::new(engine(bucket_policy(1)));

    let mut svc1 = layer.layer(MockService::new());
    let mut svc2 = layer.clone().layer(MockService::new());

    assert!(svc1.ready().await.unwrap().call(request("/", Some("carol"))).await.is_ok());

    // svc2 should now be throttled because svc1 used the token
    assert!(svc2.ready().await.unwrap().call(request("/", Some("carol"))).await.is_err());
}

#[tokio::test]
async fn test_store_failure_fails_open_by_default() {
    let mock = MockService::new();
    let engine = engine_with(bucket_policy(1), Arc::new(RefusingStore), LimiterOptions::default());
    let mut service = QuotaLayer::new(Arc::clone(&engine)).layer(mock.clone());

    for _ in 0..3 {
        let response = service
            .ready()
            .await
            .unwrap()
            .call(request("/", Some("dave")))
            .await
            .unwrap();
        assert_eq!(response.headers()["x-ratelimit-algorithm"], "error");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }
    assert_eq!(mock.count.load(Ordering::SeqCst), 3);
    assert_eq!(engine.error_count(), 3);
}

#[tokio::test]
async fn test_store_failure_fails_closed_when_configured() {
    let mock = MockService::new();
    let options = LimiterOptions::default().with_fail_open(false);
    let engine = engine_with(bucket_policy(1), Arc::new(RefusingStore), options);
    let mut service = QuotaLayer::new(engine).layer(mock.clone());

    let err = service
        .ready()
        .await
        .unwrap()
        .call(request("/", Some("dave")))
        .await
        .unwrap_err();

    let err = quota_error(err);
    assert!(matches!(err, QuotaError::Unavailable(_)));
    assert_eq!(err.to_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(mock.count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_builtin_auth_override_limits_per_ip() {
    let service = ServiceBuilder::new()
        .quota_limit(Arc::new(QuotaEngine::in_memory()))
        .service(MockService::new());

    let mut denied = 0;
    for _ in 0..12 {
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/auth/login")
            .header("x-forwarded-for", "203.0.113.50")
            .body(())
            .unwrap();
        if service.clone().oneshot(req).await.is_err() {
            denied += 1;
        }
    }
    assert_eq!(denied, 2);
}

#[tokio::test]
async fn test_actual_concurrency() {
    let mock = MockService::new();
    let service = make_quota_svc(engine(bucket_policy(20)), None, mock.clone());

    let handles = (0..50).map(|_| {
        let svc = service.clone();
        tokio::spawn(async move { svc.oneshot(request("/", Some("hammer"))).await })
    });

    let results = join_all(handles).await;
    let success_count = results
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();

    assert_eq!(success_count, 20);
    assert_eq!(mock.count.load(Ordering::SeqCst), 20);
}

#[test]
fn test_error_display() {
    let err = QuotaError::Unavailable("store call timed out after 250ms".to_string());
    assert_eq!(
        err.to_string(),
        "Quota store unavailable: store call timed out after 250ms"
    );
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[cfg(feature = "axum")]
#[tokio::test]
async fn test_axum_into_response() {
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    let mut service = QuotaLayer::new(engine(bucket_policy(1))).layer(MockService::new());
    service
        .ready()
        .await
        .unwrap()
        .call(request("/orders", Some("erin")))
        .await
        .unwrap();
    let err = service
        .ready()
        .await
        .unwrap()
        .call(request("/orders", Some("erin")))
        .await
        .unwrap_err();

    let response = quota_error(err).into_response();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "1");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["path"], "/orders");
}
