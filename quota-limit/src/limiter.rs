use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use serde::Deserialize;

use crate::decision::Decision;
use crate::error::StoreError;
use crate::fixed_window::FixedWindow;
use crate::key::QuotaKey;
use crate::policy::Algorithm;
use crate::policy::Policy;
use crate::sliding_window::SlidingWindow;
use crate::store::QuotaStore;
use crate::store::StoreReply;
use crate::token_bucket::TokenBucket;

/// The core trait for all quota algorithms.
///
/// A check is a single atomic round-trip against the shared store. It never
/// fails: store errors are converted into an error [`Decision`] at this
/// boundary.
#[async_trait]
pub trait AtomicLimiter: Debug + Send + Sync {
    fn algorithm(&self) -> Algorithm;

    async fn check(&self, key: &QuotaKey, policy: &Policy, now: SystemTime) -> Decision;
}

/// How limiters treat the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimiterOptions {
    /// Allow requests when the store cannot be reached.
    pub fail_open: bool,
    /// Upper bound of a single store round-trip.
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            fail_open: true,
            store_timeout: Duration::from_millis(250),
        }
    }
}

impl LimiterOptions {
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}

#[derive(Clone, Debug)]
struct BackendMetrics {
    store_errors: Counter<u64>,
}

/// The store and failure handling shared by the limiter implementations.
#[derive(Clone, Debug)]
pub(crate) struct Backend {
    store: Arc<dyn QuotaStore>,
    options: LimiterOptions,
    errors: Arc<AtomicU64>,
    instruments: BackendMetrics,
}

impl Backend {
    pub(crate) fn new(store: Arc<dyn QuotaStore>, options: LimiterOptions) -> Self {
        let meter = global::meter("quota_limiter");
        let instruments = BackendMetrics {
            store_errors: meter.u64_counter("quota_store_errors").build(),
        };

        Self {
            store,
            options,
            errors: Arc::new(AtomicU64::new(0)),
            instruments,
        }
    }

    pub(crate) fn store(&self) -> &dyn QuotaStore {
        self.store.as_ref()
    }

    pub(crate) fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Runs one store call under the configured timeout, turning a panic
    /// inside the store into a [`StoreError`].
    pub(crate) async fn execute<F>(&self, call: F) -> Result<StoreReply, StoreError>
    where
        F: Future<Output = Result<StoreReply, StoreError>> + Send,
    {
        let guarded = AssertUnwindSafe(call).catch_unwind();
        match tokio::time::timeout(self.options.store_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(StoreError::Panicked(panic_message(payload))),
            Err(_) => Err(StoreError::Timeout(self.options.store_timeout)),
        }
    }

    pub(crate) async fn ping(&self) -> Result<(), StoreError> {
        match tokio::time::timeout(self.options.store_timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.options.store_timeout)),
        }
    }

    /// Converts a failed store call into a decision and records it.
    pub(crate) fn failure(
        &self,
        key: &QuotaKey,
        algorithm: Algorithm,
        err: StoreError,
        now: SystemTime,
    ) -> Decision {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .store_errors
            .add(1, &[KeyValue::new("algorithm", algorithm.name())]);
        tracing::error!(
            key = %key,
            algorithm = %algorithm,
            fail_open = self.options.fail_open,
            error = %err,
            "quota store call failed"
        );
        Decision::error(key, &err, self.options.fail_open, now)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Dispatches each check to the algorithm its policy selects.
#[derive(Debug, Clone)]
pub struct QuotaLimiter {
    backend: Backend,
    fixed_window: FixedWindow,
    token_bucket: TokenBucket,
    sliding_window: SlidingWindow,
}

impl QuotaLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, options: LimiterOptions) -> Self {
        let backend = Backend::new(store, options);
        Self {
            fixed_window: FixedWindow::with_backend(backend.clone()),
            token_bucket: TokenBucket::with_backend(backend.clone()),
            sliding_window: SlidingWindow::with_backend(backend.clone()),
            backend,
        }
    }

    pub fn limiter(&self, algorithm: Algorithm) -> &dyn AtomicLimiter {
        match algorithm {
            Algorithm::FixedWindow => &self.fixed_window,
            Algorithm::TokenBucket => &self.token_bucket,
            Algorithm::SlidingWindow => &self.sliding_window,
        }
    }

    pub async fn check(&self, key: &QuotaKey, policy: &Policy, now: SystemTime) -> Decision {
        self.limiter(policy.algorithm()).check(key, policy, now).await
    }

    /// Number of failed store calls since creation.
    pub fn error_count(&self) -> u64 {
        self.backend.error_count()
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }
}
