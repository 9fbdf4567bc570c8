use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use http::Request;
use http::Response;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::ServiceExt;
use tower::service_fn;
use tracing_subscriber::EnvFilter;

use quota_limit::QuotaConfig;
use tower_quota::QuotaError;
use tower_quota::make_quota_svc;

/// Fire concurrent requests through the quota layer and report latencies.
#[derive(Debug, Parser)]
struct Args {
    /// TOML quota configuration; the built-in gateway policies when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total number of requests
    #[arg(long, default_value_t = 10_000)]
    requests: usize,

    /// Distinct users the requests are spread over
    #[arg(long, default_value_t = 10)]
    users: usize,

    /// Request path, selects the policy
    #[arg(long, default_value = "/api/v1/orders")]
    path: String,

    /// Named policy applied instead of selection by path
    #[arg(long)]
    policy: Option<String>,

    /// Simulated latency of the protected service
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1ms")]
    work: Duration,
}

#[derive(Debug, Default)]
struct Outcomes {
    allowed: usize,
    rate_limited: usize,
    unavailable: usize,
    unknown: usize,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => QuotaConfig::from_path(path)?,
        None => QuotaConfig::default(),
    };
    let engine = Arc::new(config.engine().await?);
    engine.ping().await?;

    let work = args.work;
    let svc = make_quota_svc(
        Arc::clone(&engine),
        args.policy.as_deref(),
        service_fn(move |_req: Request<()>| async move {
            sleep(work).await;
            Ok::<_, BoxError>(Response::new(()))
        }),
    );

    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut outcomes = Outcomes::default();
    let barrier = Arc::new(Barrier::new(args.requests));
    let mut tasks = JoinSet::new();

    let start = Instant::now();
    for n in 0..args.requests {
        let svc = svc.clone();
        let bar = Arc::clone(&barrier);
        let req = Request::builder()
            .method("POST")
            .uri(args.path.as_str())
            .header("x-user-id", format!("user-{}", n % args.users.max(1)))
            .body(())?;
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let res = svc.oneshot(req).await;
            (res, req_start.elapsed())
        });
    }

    while let Some(task) = tasks.join_next().await {
        let (res, elapsed) = task?;
        hist_elapsed.record(elapsed.as_micros() as u64)?;
        match res {
            Ok(_) => outcomes.allowed += 1,
            Err(e) => match e.downcast_ref::<QuotaError>() {
                Some(QuotaError::RateLimited { .. }) => outcomes.rate_limited += 1,
                Some(QuotaError::Unavailable(_)) => outcomes.unavailable += 1,
                None => outcomes.unknown += 1,
            },
        }
    }

    let total_duration = start.elapsed();
    println!("--- {} ---", args.path);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Allowed/Total:   {}/{}", outcomes.allowed, args.requests);
    println!(
        "Total Rate:      {:.2} req/sec",
        args.requests as f64 / total_duration.as_secs_f64()
    );
    println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
    println!("P99 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.99));
    println!("Rate Limited:    {}", outcomes.rate_limited);
    if outcomes.unavailable > 0 {
        println!("Unavailable:     {}", outcomes.unavailable);
    }
    if outcomes.unknown > 0 {
        println!("Unknown:         {}", outcomes.unknown);
    }
    println!("Store Errors:    {}", engine.error_count());

    Ok(())
}
