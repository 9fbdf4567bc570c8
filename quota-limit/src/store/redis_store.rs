//! Redis-backed quota store.
//!
//! Each algorithm is a Lua script executed with `EVALSHA`, so the whole
//! read-modify-write of a key happens inside Redis without interleaving.
//! `redis::Script` reloads a script transparently when the server answers
//! `NOSCRIPT`, e.g. after a restart or a `SCRIPT FLUSH`.
//!
//! Keys live under a configurable prefix and carry a TTL refreshed on every
//! access, so idle quota state disappears on its own.

use std::fmt;

use ::redis::Client;
use ::redis::Script;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use serde::Deserialize;

use super::FixedWindowRequest;
use super::QuotaStore;
use super::SlidingWindowRequest;
use super::StoreReply;
use super::TokenBucketRequest;
use crate::error::StoreError;

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1/`
    pub url: String,
    /// Prefix for every key written by the store (default: "rate_limit:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            key_prefix: "rate_limit:".to_string(),
        }
    }
}

struct Scripts {
    fixed_window: Script,
    token_bucket: Script,
    sliding_window: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            fixed_window: Script::new(include_str!("lua/fixed_window.lua")),
            token_bucket: Script::new(include_str!("lua/token_bucket.lua")),
            sliding_window: Script::new(include_str!("lua/sliding_window.lua")),
        }
    }
}

/// A [`QuotaStore`] shared by every gateway instance connected to the same
/// Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    scripts: Scripts,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.config.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with the default key prefix.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..Default::default()
        })
        .await
    }

    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!(key_prefix = %config.key_prefix, "connected to redis quota store");

        Ok(Self {
            connection,
            config,
            scripts: Scripts::load(),
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn run(&self, script: &Script, key: &str, args: &[u64]) -> Result<StoreReply, StoreError> {
        let mut invocation = script.prepare_invoke();
        invocation.key(self.key(key));
        for arg in args {
            invocation.arg(*arg);
        }

        // The manager multiplexes a single connection and is cheap to clone
        let mut connection = self.connection.clone();
        let values: Vec<i64> = invocation.invoke_async(&mut connection).await?;
        StoreReply::from_values(&values)
    }
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn fixed_window(
        &self,
        key: &str,
        request: &FixedWindowRequest,
    ) -> Result<StoreReply, StoreError> {
        let args = [
            request.now_ms,
            request.window_start_ms,
            request.window_ms,
            request.limit,
            request.cost,
            request.ttl_ms,
        ];
        self.run(&self.scripts.fixed_window, key, &args).await
    }

    async fn token_bucket(
        &self,
        key: &str,
        request: &TokenBucketRequest,
    ) -> Result<StoreReply, StoreError> {
        let args = [
            request.now_ms,
            request.rate_per_second,
            request.capacity,
            request.cost,
            request.ttl_ms,
        ];
        self.run(&self.scripts.token_bucket, key, &args).await
    }

    async fn sliding_window(
        &self,
        key: &str,
        request: &SlidingWindowRequest,
    ) -> Result<StoreReply, StoreError> {
        let mut invocation = self.scripts.sliding_window.prepare_invoke();
        invocation
            .key(self.key(key))
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.sub_window_ms)
            .arg(request.rate_per_second)
            .arg(request.capacity)
            .arg(request.sustained_limit)
            .arg(request.cost)
            .arg(u8::from(request.strict))
            .arg(request.member())
            .arg(request.ttl_ms);

        let mut connection = self.connection.clone();
        let values: Vec<i64> = invocation.invoke_async(&mut connection).await?;
        StoreReply::from_values(&values)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let pong: String = ::redis::cmd("PING").query_async(&mut connection).await?;
        if pong != "PONG" {
            return Err(StoreError::Malformed(format!("unexpected PING reply {pong:?}")));
        }
        Ok(())
    }
}
