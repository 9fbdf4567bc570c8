use std::sync::OnceLock;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::error::StoreError;
use crate::key::QuotaKey;
use crate::policy::Algorithm;
use crate::policy::Policy;
use crate::store::StoreReply;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";
pub const ALGORITHM_HEADER: &str = "X-RateLimit-Algorithm";
pub const WINDOW_HEADER: &str = "X-RateLimit-Window";
pub const STATUS_HEADER: &str = "X-RateLimit-Status";
pub const REASON_HEADER: &str = "X-RateLimit-Reason";

/// Algorithm name carried by decisions produced from a store failure.
pub const ERROR_ALGORITHM: &str = "error";

/// The outcome of a single quota check.
///
/// Decisions are produced by the limiters and never persisted. The header
/// projection is computed on first use and cached.
#[derive(Debug, Clone)]
pub struct Decision {
    allowed: bool,
    reason: Option<String>,
    remaining_tokens: i64,
    total_requests: u64,
    retry_after: Duration,
    window_reset_time: Option<SystemTime>,
    algorithm: &'static str,
    rate_limit_key: String,
    requests_per_second: Option<u32>,
    window_size: Option<Duration>,
    penalty_duration: Option<Duration>,
    effective_burst: Option<u32>,
    checked_at: SystemTime,
    headers: OnceLock<Vec<(&'static str, String)>>,
}

impl Decision {
    pub(crate) fn from_reply(
        reply: StoreReply,
        algorithm: Algorithm,
        key: &QuotaKey,
        policy: &Policy,
        now: SystemTime,
    ) -> Self {
        Self {
            allowed: reply.allowed,
            reason: (!reply.allowed).then(|| policy.denial_message().to_string()),
            remaining_tokens: reply.remaining,
            total_requests: reply.total,
            retry_after: Duration::from_millis(reply.retry_after_ms),
            window_reset_time: None,
            algorithm: algorithm.name(),
            rate_limit_key: key.to_string(),
            requests_per_second: Some(policy.requests_per_second()),
            window_size: Some(policy.window_size()),
            penalty_duration: (!reply.allowed).then(|| policy.penalty_duration()),
            effective_burst: Some(policy.effective_burst_capacity()),
            checked_at: now,
            headers: OnceLock::new(),
        }
    }

    pub(crate) fn with_window_reset(mut self, reset: SystemTime) -> Self {
        self.window_reset_time = Some(reset);
        self
    }

    /// A decision standing in for a failed store call.
    ///
    /// `allowed` follows the limiter's fail-open setting.
    pub(crate) fn error(key: &QuotaKey, err: &StoreError, allowed: bool, now: SystemTime) -> Self {
        Self {
            allowed,
            reason: Some(err.to_string()),
            remaining_tokens: -1,
            total_requests: 0,
            retry_after: Duration::ZERO,
            window_reset_time: None,
            algorithm: ERROR_ALGORITHM,
            rate_limit_key: key.to_string(),
            requests_per_second: None,
            window_size: None,
            penalty_duration: None,
            effective_burst: None,
            checked_at: now,
            headers: OnceLock::new(),
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Present only when the request was denied or the check failed.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Remaining capacity, `-1` on error decisions.
    pub fn remaining_tokens(&self) -> i64 {
        self.remaining_tokens
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Wait before retrying. On an allowed sliding window decision a non-zero
    /// value is the sustained rate penalty.
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    pub fn window_reset_time(&self) -> Option<SystemTime> {
        self.window_reset_time
    }

    pub fn algorithm(&self) -> &'static str {
        self.algorithm
    }

    pub fn rate_limit_key(&self) -> &str {
        &self.rate_limit_key
    }

    pub fn requests_per_second(&self) -> Option<u32> {
        self.requests_per_second
    }

    pub fn window_size(&self) -> Option<Duration> {
        self.window_size
    }

    /// The policy's back-off, informational and only set on denials.
    pub fn penalty_duration(&self) -> Option<Duration> {
        self.penalty_duration
    }

    /// Burst capacity after the burst multiplier, for diagnostics.
    pub fn effective_burst(&self) -> Option<u32> {
        self.effective_burst
    }

    pub fn checked_at(&self) -> SystemTime {
        self.checked_at
    }

    pub fn is_error(&self) -> bool {
        self.remaining_tokens < 0 || self.algorithm == ERROR_ALGORITHM
    }

    /// Denied with more requests counted than the sustained rate, so the
    /// burst allowance was exhausted.
    pub fn burst_protection_triggered(&self) -> bool {
        if self.allowed || self.is_error() {
            return false;
        }
        match self.requests_per_second {
            Some(rate) => self.total_requests > u64::from(rate),
            None => false,
        }
    }

    /// `Retry-After` in whole seconds. Truncated, but never below one second
    /// while a wait remains.
    pub fn retry_after_secs(&self) -> u64 {
        if self.retry_after.is_zero() {
            return 0;
        }
        self.retry_after.as_secs().max(1)
    }

    /// When the client may expect fresh capacity.
    pub fn reset_time(&self) -> SystemTime {
        self.window_reset_time
            .unwrap_or(self.checked_at + self.retry_after)
    }

    /// The response headers describing this decision, in a stable order.
    pub fn headers(&self) -> &[(&'static str, String)] {
        self.headers.get_or_init(|| self.project_headers())
    }

    fn project_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(8);

        if let Some(rate) = self.requests_per_second.filter(|rate| *rate > 0) {
            headers.push((LIMIT_HEADER, rate.to_string()));
        }
        headers.push((REMAINING_HEADER, self.remaining_tokens.max(0).to_string()));
        headers.push((RESET_HEADER, epoch_secs(self.reset_time()).to_string()));

        if !self.allowed && !self.retry_after.is_zero() {
            headers.push((RETRY_AFTER_HEADER, self.retry_after_secs().to_string()));
        }

        headers.push((ALGORITHM_HEADER, self.algorithm.to_string()));
        if let Some(window) = self.window_size {
            headers.push((WINDOW_HEADER, window.as_secs_f64().to_string()));
        }

        let status = if self.allowed { "allowed" } else { "denied" };
        headers.push((STATUS_HEADER, status.to_string()));
        if let Some(reason) = &self.reason {
            headers.push((REASON_HEADER, reason.clone()));
        }

        headers
    }

    /// A message suitable for the client.
    pub fn user_message(&self) -> String {
        if self.allowed {
            return "Request allowed".to_string();
        }
        if let Some(reason) = &self.reason {
            return reason.clone();
        }
        if !self.retry_after.is_zero() {
            return format!(
                "Rate limit exceeded. Please try again in {} seconds.",
                self.retry_after_secs()
            );
        }
        "Rate limit exceeded. Please reduce request frequency.".to_string()
    }

    /// A one line summary for logs.
    pub fn technical_details(&self) -> String {
        format!(
            "RateLimit[key={}, allowed={}, remaining={}, algorithm={}, retry_after={:?}, effective_burst={}]",
            self.rate_limit_key,
            self.allowed,
            self.remaining_tokens,
            self.algorithm,
            self.retry_after,
            self.effective_burst
                .map_or_else(|| "none".to_string(), |burst| burst.to_string())
        )
    }

    /// Share of the sustained rate consumed, capped at 100.
    pub fn capacity_used_percentage(&self) -> f64 {
        match self.requests_per_second {
            Some(rate) if rate > 0 => {
                (self.total_requests as f64 / rate as f64 * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }

    /// The 429 payload for a denied request to `path`.
    pub fn rejection(&self, path: &str) -> Rejection {
        Rejection {
            timestamp: humantime::format_rfc3339_seconds(self.checked_at).to_string(),
            status: 429,
            error: "Too Many Requests",
            message: self.user_message(),
            path: path.to_string(),
            rate_limit_details: RateLimitDetails {
                remaining_tokens: self.remaining_tokens.max(0),
                retry_after_seconds: self.retry_after_secs(),
                algorithm: self.algorithm,
                window_size: self
                    .window_size
                    .map(|window| humantime::format_duration(window).to_string()),
                penalty_duration: self
                    .penalty_duration
                    .map(|penalty| humantime::format_duration(penalty).to_string()),
            },
        }
    }
}

/// Structured body of a rate limited response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub timestamp: String,
    pub status: u16,
    pub error: &'static str,
    pub message: String,
    pub path: String,
    pub rate_limit_details: RateLimitDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDetails {
    pub remaining_tokens: i64,
    pub retry_after_seconds: u64,
    pub algorithm: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_duration: Option<String>,
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs())
        .unwrap_or_default()
}
