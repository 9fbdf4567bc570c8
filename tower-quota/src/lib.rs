//! # Tower Quota
//!
//! `tower-quota` enforces the request quotas of a [`quota_limit::QuotaEngine`]
//! in the [Tower](https://github.com/tower-rs/tower) ecosystem.
//!
//! ## The Quota Layer
//! Unlike limiters that return `Poll::Pending` when full, the [`QuotaLayer`]
//! never queues. Each request is decided once, against the store shared by
//! every gateway instance:
//!
//! 1. **Selection**: the policy comes from the request path, or from a name
//!    fixed with [`QuotaLayer::with_policy`].
//! 2. **Identity**: the quota key is derived from the identity headers and
//!    the peer address, see [`request_context`].
//! 3. **Admission**: allowed requests reach the inner service and their
//!    responses carry the `X-RateLimit-*` headers. Denied requests fail with
//!    [`QuotaError::RateLimited`], which holds the structured 429 body.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`QuotaError`] (429, or 503 when the
//!   store fails closed) and reads the peer address from `ConnectInfo`.

mod error;
mod layer;
mod service;
mod utils;

#[cfg(test)]
mod tests;

pub use error::QuotaError;
pub use layer::QuotaLayer;
pub use service::QuotaService;
pub use service::request_context;
pub use utils::ServiceBuilderExt;
pub use utils::make_quota_svc;
