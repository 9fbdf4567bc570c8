//! The shared store quota state lives in.
//!
//! Every [`QuotaStore`] method is a single atomic read-modify-write: no
//! other caller can observe or modify the key between the read and the
//! write. This is the only synchronisation the limiters rely on.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::StoreError;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStoreConfig;

/// Fixed window parameters. `key` addresses a single window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindowRequest {
    pub now_ms: u64,
    pub window_start_ms: u64,
    pub window_ms: u64,
    pub limit: u64,
    pub cost: u64,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucketRequest {
    pub now_ms: u64,
    pub rate_per_second: u64,
    pub capacity: u64,
    pub cost: u64,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowRequest {
    pub now_ms: u64,
    pub window_ms: u64,
    pub sub_window_ms: u64,
    pub rate_per_second: u64,
    pub capacity: u64,
    pub sustained_limit: u64,
    pub cost: u64,
    pub strict: bool,
    /// Caller chosen uniqueness tag for the recorded entry.
    pub nonce: u64,
    pub ttl_ms: u64,
}

impl SlidingWindowRequest {
    pub fn sub_window(&self) -> u64 {
        self.now_ms / self.sub_window_ms
    }

    /// Name of the entry recorded when this request is admitted.
    pub fn member(&self) -> String {
        format!("{}:{}:{:016x}", self.sub_window(), self.cost, self.nonce)
    }
}

/// Outcome of one atomic store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReply {
    pub allowed: bool,
    pub remaining: i64,
    pub retry_after_ms: u64,
    pub total: u64,
}

impl StoreReply {
    /// Decodes the `[allowed, remaining, retry_after_ms, total]` reply of
    /// the store scripts.
    pub fn from_values(values: &[i64]) -> Result<Self, StoreError> {
        match values {
            [allowed, remaining, retry_after, total, ..] => Ok(Self {
                allowed: *allowed == 1,
                remaining: *remaining,
                retry_after_ms: u64::try_from(*retry_after).unwrap_or_default(),
                total: u64::try_from(*total).unwrap_or_default(),
            }),
            _ => Err(StoreError::Malformed(format!(
                "expected 4 values, got {}",
                values.len()
            ))),
        }
    }
}

/// A store able to run the three quota algorithms atomically.
#[async_trait]
pub trait QuotaStore: Debug + Send + Sync {
    async fn fixed_window(
        &self,
        key: &str,
        request: &FixedWindowRequest,
    ) -> Result<StoreReply, StoreError>;

    async fn token_bucket(
        &self,
        key: &str,
        request: &TokenBucketRequest,
    ) -> Result<StoreReply, StoreError>;

    async fn sliding_window(
        &self,
        key: &str,
        request: &SlidingWindowRequest,
    ) -> Result<StoreReply, StoreError>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_replies_are_malformed() {
        assert!(matches!(
            StoreReply::from_values(&[1, 2, 3]),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn decodes_script_reply() {
        let reply = StoreReply::from_values(&[0, 3, 250, 17]).unwrap();
        assert_eq!(
            reply,
            StoreReply {
                allowed: false,
                remaining: 3,
                retry_after_ms: 250,
                total: 17,
            }
        );
    }

    #[test]
    fn member_encodes_sub_window_and_cost() {
        let request = SlidingWindowRequest {
            now_ms: 12_345,
            window_ms: 1_000,
            sub_window_ms: 200,
            rate_per_second: 2,
            capacity: 5,
            sustained_limit: 2,
            cost: 3,
            strict: false,
            nonce: 0xabc,
            ttl_ms: 11_000,
        };
        assert_eq!(request.member(), "61:3:0000000000000abc");
    }
}
