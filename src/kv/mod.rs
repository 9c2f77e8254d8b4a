//! Key-value store port
//!
//! The coordination layer (locks, idempotency marks, the expiry queue) only
//! needs a handful of primitives. `RedisKv` is the production backend;
//! `MemoryKv` backs tests and single-node deployments.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("key-value command failed: {0}")]
    Command(String),
}

impl From<::redis::RedisError> for KvError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            KvError::Unavailable(e.to_string())
        } else {
            KvError::Command(e.to_string())
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name for logs and health reports.
    fn backend(&self) -> &'static str;

    /// Set `key` only if absent. Returns true if this call created it.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn exists(&self, key: &str) -> KvResult<bool>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Delete `key` only while it still holds `expected`. Atomic.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool>;

    /// Reset the TTL of `key` only while it still holds `expected`. Atomic.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
    -> KvResult<bool>;

    /// Remaining time to live, `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>>;

    async fn zadd(&self, set: &str, member: &str, score: i64) -> KvResult<()>;

    /// Members with `min <= score <= max`, ascending by score, at most `limit`.
    async fn zrange_by_score(
        &self,
        set: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> KvResult<Vec<String>>;

    /// Remove a member. Returns true if this call removed it.
    async fn zrem(&self, set: &str, member: &str) -> KvResult<bool>;

    async fn zscore(&self, set: &str, member: &str) -> KvResult<Option<i64>>;

    async fn ping(&self) -> KvResult<()>;
}
