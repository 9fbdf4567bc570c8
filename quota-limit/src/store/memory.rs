use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::FixedWindowRequest;
use super::QuotaStore;
use super::SlidingWindowRequest;
use super::StoreReply;
use super::TokenBucketRequest;
use crate::error::StoreError;
use crate::fixed_window;
use crate::sliding_window;
use crate::sliding_window::LogEntry;
use crate::token_bucket;
use crate::token_bucket::BucketState;

/// Expired entries are swept after this many operations.
const SWEEP_INTERVAL: u64 = 1_024;

#[derive(Debug)]
enum State {
    Counter(u64),
    Bucket(BucketState),
    Log(Vec<LogEntry>),
}

#[derive(Debug)]
struct Entry {
    state: State,
    expires_at_ms: u64,
}

/// An in-process [`QuotaStore`].
///
/// Each operation runs under a single lock, which makes it atomic with
/// respect to every other operation on the store. Expiry is evaluated
/// lazily against the `now_ms` of the request, so the store follows the
/// caller's clock.
///
/// Only suitable when a single process enforces the quotas.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    operations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Runs `op` on the live state of `key` while holding the lock.
    ///
    /// `op` returns the state to store, or `None` to leave the key absent.
    /// State of the wrong kind is handed back untouched.
    fn update<F>(&self, key: &str, now_ms: u64, ttl_ms: u64, op: F) -> Result<StoreReply, StoreError>
    where
        F: FnOnce(Option<State>) -> Result<(Option<State>, StoreReply), State>,
    {
        let mut entries = self.entries.lock();

        if self.operations.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            entries.retain(|_, entry| entry.expires_at_ms > now_ms);
        }

        let live = entries
            .remove(key)
            .filter(|entry| entry.expires_at_ms > now_ms);
        let expires_at_ms = live.as_ref().map(|entry| entry.expires_at_ms);

        let (next, reply) = match op(live.map(|entry| entry.state)) {
            Ok(applied) => applied,
            Err(state) => {
                let expires_at_ms = expires_at_ms.unwrap_or(now_ms + ttl_ms);
                entries.insert(
                    key.to_string(),
                    Entry {
                        state,
                        expires_at_ms,
                    },
                );
                return Err(StoreError::Malformed(format!(
                    "{key} holds state of another algorithm"
                )));
            }
        };
        if let Some(state) = next {
            entries.insert(
                key.to_string(),
                Entry {
                    state,
                    expires_at_ms: now_ms + ttl_ms,
                },
            );
        }
        Ok(reply)
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn fixed_window(
        &self,
        key: &str,
        request: &FixedWindowRequest,
    ) -> Result<StoreReply, StoreError> {
        self.update(key, request.now_ms, request.ttl_ms, |state| {
            let current = match state {
                None => None,
                Some(State::Counter(count)) => Some(count),
                Some(other) => return Err(other),
            };
            let (count, reply) = fixed_window::apply(current, request);
            Ok((count.map(State::Counter), reply))
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        request: &TokenBucketRequest,
    ) -> Result<StoreReply, StoreError> {
        self.update(key, request.now_ms, request.ttl_ms, |state| {
            let current = match state {
                None => None,
                Some(State::Bucket(bucket)) => Some(bucket),
                Some(other) => return Err(other),
            };
            let (bucket, reply) = token_bucket::apply(current, request);
            Ok((Some(State::Bucket(bucket)), reply))
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        request: &SlidingWindowRequest,
    ) -> Result<StoreReply, StoreError> {
        self.update(key, request.now_ms, request.ttl_ms, |state| {
            let mut log = match state {
                None => Vec::new(),
                Some(State::Log(log)) => log,
                Some(other) => return Err(other),
            };
            let reply = sliding_window::apply(&mut log, request);
            let next = (!log.is_empty()).then_some(State::Log(log));
            Ok((next, reply))
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
