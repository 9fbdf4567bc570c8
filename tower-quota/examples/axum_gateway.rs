use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::routing::post;
use tower::BoxError;
use tower::ServiceBuilder;
use tracing_subscriber::EnvFilter;

use quota_limit::PathPattern;
use quota_limit::QuotaConfig;
use tower_quota::QuotaError;
use tower_quota::QuotaLayer;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 1. Setup the engine: QUOTA_CONFIG names a TOML file, else the built-in policies
    let config = match std::env::var("QUOTA_CONFIG") {
        Ok(path) => QuotaConfig::from_path(path)?,
        Err(_) => QuotaConfig::default(),
    };
    let engine = Arc::new(config.engine().await?);

    // 2. Setup the quota layer, exempting health checks
    let quota_layer =
        QuotaLayer::new(engine).with_skip_paths([PathPattern::parse("/health/**")?]);

    // 3. Build the Router
    let app = Router::new()
        .route("/health/live", get(|| async { "ok" }))
        .route("/api/v1/orders", post(|| async { "order accepted" }))
        .route("/api/v1/auth/login", post(|| async { "welcome" }))
        .route("/api/v1/portfolio", get(|| async { "portfolio" }))
        .layer(
            ServiceBuilder::new()
                // 1. The outermost layer: catches BoxError and returns Response
                .layer(HandleErrorLayer::new(handle_quota_error))
                // 2. The quota layer: introduces BoxError
                .layer(quota_layer),
        );

    // 4. Serve, with peer addresses for per-IP quotas
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn handle_quota_error(err: BoxError) -> impl IntoResponse {
    if let Some(quota_err) = err.downcast_ref::<QuotaError>() {
        quota_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}
