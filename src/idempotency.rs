//! Idempotency Guard
//!
//! Short-lived dedup marks in the key-value store. The order engine checks
//! before doing work and sets the mark only after commit, so failed attempts
//! never block a retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core_types::{GoodsId, UserId};
use crate::kv::{KvResult, KvStore};

pub const DEFAULT_PREFIX: &str = "idem:";

/// Width of the time bucket in an order-create key.
///
/// `Hour` means the same user may buy the same good again once the wall
/// clock crosses into the next hour, even a second later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    #[default]
    Hour,
    Day,
}

impl Granularity {
    fn bucket(self, at: DateTime<Utc>) -> String {
        let fmt = match self {
            Granularity::Minute => "%Y%m%d_%H%M",
            Granularity::Hour => "%Y%m%d_%H",
            Granularity::Day => "%Y%m%d",
        };
        at.format(fmt).to_string()
    }
}

pub struct IdempotencyGuard {
    kv: Arc<dyn KvStore>,
    prefix: String,
    granularity: Granularity,
}

impl IdempotencyGuard {
    pub fn new(kv: Arc<dyn KvStore>, granularity: Granularity) -> Self {
        Self {
            kv,
            prefix: DEFAULT_PREFIX.to_string(),
            granularity,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// `{user_id}:{goods_id}:{bucket}` for the bucket containing `at`.
    pub fn order_create_key(&self, user_id: UserId, goods_id: GoodsId, at: DateTime<Utc>) -> String {
        format!(
            "order_create:{}:{}:{}",
            user_id,
            goods_id,
            self.granularity.bucket(at)
        )
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn check_only(&self, key: &str) -> KvResult<bool> {
        self.kv.exists(&self.full_key(key)).await
    }

    pub async fn set_mark(&self, key: &str, ttl: Duration) -> KvResult<()> {
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Idempotency mark set");
        self.kv.set(&self.full_key(key), "1", ttl).await
    }

    pub async fn clear_mark(&self, key: &str) -> KvResult<()> {
        debug!(key = %key, "Idempotency mark cleared");
        self.kv.delete(&self.full_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_boundaries() {
        let kv = Arc::new(MemoryKv::new());
        let guard = IdempotencyGuard::new(kv, Granularity::Hour);
        let a = Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 1).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 9, 14, 59, 59).unwrap();
        let c = Utc.with_ymd_and_hms(2024, 3, 9, 15, 0, 0).unwrap();

        assert_eq!(guard.order_create_key(1, 2, a), "order_create:1:2:20240309_14");
        assert_eq!(guard.order_create_key(1, 2, a), guard.order_create_key(1, 2, b));
        assert_ne!(guard.order_create_key(1, 2, b), guard.order_create_key(1, 2, c));
    }

    #[test]
    fn test_other_granularities() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 7, 0).unwrap();
        assert_eq!(Granularity::Minute.bucket(at), "20240309_1407");
        assert_eq!(Granularity::Day.bucket(at), "20240309");
    }

    #[tokio::test]
    async fn test_mark_lifecycle() {
        let kv = Arc::new(MemoryKv::new());
        let guard = IdempotencyGuard::new(kv.clone(), Granularity::Hour);

        assert!(!guard.check_only("k").await.unwrap());
        guard.set_mark("k", Duration::from_secs(60)).await.unwrap();
        assert!(guard.check_only("k").await.unwrap());
        assert!(kv.exists("idem:k").await.unwrap());

        guard.clear_mark("k").await.unwrap();
        assert!(!guard.check_only("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_expires() {
        let kv = Arc::new(MemoryKv::new());
        let guard = IdempotencyGuard::new(kv, Granularity::Hour);
        guard.set_mark("k", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!guard.check_only("k").await.unwrap());
    }
}
