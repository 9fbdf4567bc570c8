//! # quota-limit
//!
//! `quota-limit` enforces request quotas for an API gateway, consistently
//! across every instance that shares the same quota store.
//!
//! ## Core Philosophy
//!
//! Gateway instances hold no quota state. Every check is a single atomic
//! read-modify-write against a shared [`QuotaStore`] (Redis in production,
//! [`MemoryStore`] for a single process), so concurrent checks on the same
//! key never over-admit, no matter which instance serves them.
//!
//! ## Key Concepts
//!
//! * **Policy**: how many requests a client may make and which algorithm
//!   counts them. See [`Policy`] and the [`presets`].
//! * **Key**: who a request is counted against, derived by the
//!   [`KeyResolver`] from the policy's [`KeyStrategy`].
//! * **Limiter**: a fixed window, token bucket or sliding window
//!   [`AtomicLimiter`] that turns one store round-trip into a [`Decision`].
//! * **Fail open**: when the store is unreachable the request is allowed and
//!   the failure is recorded, unless [`LimiterOptions::fail_open`] is off.
//!
//! ## Example
//!
//! ```rust
//! use std::time::SystemTime;
//!
//! use quota_limit::QuotaEngine;
//! use quota_limit::RequestContext;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let engine = QuotaEngine::in_memory();
//! let ctx = RequestContext::new("POST", "/api/v1/orders").with_user("alice");
//!
//! let evaluation = engine.evaluate(&ctx, None, SystemTime::now()).await;
//! if evaluation.decision.allowed() {
//!     // Request allowed
//! }
//! for (name, value) in evaluation.decision.headers() {
//!     println!("{name}: {value}");
//! }
//! # }
//! ```

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

mod config;
mod decision;
mod engine;
mod error;
mod fixed_window;
mod key;
mod limiter;
mod pattern;
mod policy;
pub mod presets;
mod selector;
mod sliding_window;
pub mod store;
mod token_bucket;

pub use config::OverrideConfig;
pub use config::PolicyConfig;
pub use config::QuotaConfig;
pub use config::StoreConfig;
pub use decision::ALGORITHM_HEADER;
pub use decision::Decision;
pub use decision::ERROR_ALGORITHM;
pub use decision::LIMIT_HEADER;
pub use decision::REASON_HEADER;
pub use decision::REMAINING_HEADER;
pub use decision::RESET_HEADER;
pub use decision::RETRY_AFTER_HEADER;
pub use decision::RateLimitDetails;
pub use decision::Rejection;
pub use decision::STATUS_HEADER;
pub use decision::WINDOW_HEADER;
pub use engine::Evaluation;
pub use engine::QuotaEngine;
pub use error::ConfigError;
pub use error::PolicyError;
pub use error::StoreError;
pub use fixed_window::FixedWindow;
pub use key::IdentityHeaders;
pub use key::KeyResolver;
pub use key::QuotaKey;
pub use key::RequestContext;
pub use key::client_ip;
pub use limiter::AtomicLimiter;
pub use limiter::LimiterOptions;
pub use limiter::QuotaLimiter;
pub use pattern::PathPattern;
pub use policy::Algorithm;
pub use policy::EndpointOverride;
pub use policy::KeyStrategy;
pub use policy::Policy;
pub use policy::PolicyBuilder;
pub use selector::PolicySelector;
pub use sliding_window::SlidingWindow;
pub use store::MemoryStore;
pub use store::QuotaStore;
#[cfg(feature = "redis")]
pub use store::RedisStore;
#[cfg(feature = "redis")]
pub use store::RedisStoreConfig;
pub use token_bucket::TokenBucket;

/// Milliseconds since the Unix epoch; times before the epoch map to 0.
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
