//! Order expiry
//!
//! Three redundant layers cancel unpaid orders:
//! - A: sorted set `order_timeouts` (order_no -> due unix seconds), polled
//!   by [`worker::QueueWorker`]; entries are claimed by ZREM so only one
//!   worker processes each.
//! - B: [`worker::DbPoller`] scans the orders table for stale pending rows.
//! - C: per-order in-process timers ([`ExpiryTimers`]), a safety net that
//!   only exists in the process that created the order.
//!
//! All three end in `OrderEngine::cancel_expired_order`, which is idempotent.

pub mod worker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::kv::{KvResult, KvStore};

pub const ORDER_TIMEOUTS: &str = "order_timeouts";

pub struct ExpiryQueue {
    kv: Arc<dyn KvStore>,
    key: String,
}

impl ExpiryQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            key: ORDER_TIMEOUTS.to_string(),
        }
    }

    pub async fn schedule(&self, order_no: &str, due: DateTime<Utc>) -> KvResult<()> {
        debug!(order_no = %order_no, due = %due, "Expiry scheduled");
        self.kv.zadd(&self.key, order_no, due.timestamp()).await
    }

    /// Returns true if the entry existed.
    pub async fn remove(&self, order_no: &str) -> KvResult<bool> {
        self.kv.zrem(&self.key, order_no).await
    }

    /// Entries due at `now`, each removed before being returned. An entry
    /// another worker removed first is skipped. If the store fails after
    /// some entries were claimed, those are still returned.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> KvResult<Vec<String>> {
        let due = self
            .kv
            .zrange_by_score(&self.key, 0, now.timestamp(), limit)
            .await?;
        let mut claimed = Vec::with_capacity(due.len());
        for order_no in due {
            match self.kv.zrem(&self.key, &order_no).await {
                Ok(true) => claimed.push(order_no),
                Ok(false) => debug!(order_no = %order_no, "Expiry entry taken by another worker"),
                Err(e) if claimed.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        claimed = claimed.len(),
                        error = %e,
                        "Expiry claim interrupted, returning partial batch"
                    );
                    break;
                }
            }
        }
        Ok(claimed)
    }

    pub async fn due_at(&self, order_no: &str) -> KvResult<Option<DateTime<Utc>>> {
        let score = self.kv.zscore(&self.key, order_no).await?;
        Ok(score.and_then(|s| Utc.timestamp_opt(s, 0).single()))
    }
}

/// In-process one-shot timers keyed by order number.
#[derive(Default)]
pub struct ExpiryTimers {
    timers: Arc<DashMap<String, AbortHandle>>,
}

impl ExpiryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` after `delay`. Re-arming an order replaces its timer.
    pub fn arm<F>(&self, order_no: &str, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timers = Arc::clone(&self.timers);
        let key = order_no.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.remove(&key);
            fire.await;
        });
        if let Some(old) = self.timers.insert(order_no.to_string(), handle.abort_handle()) {
            old.abort();
        }
    }

    pub fn disarm(&self, order_no: &str) -> bool {
        match self.timers.remove(order_no) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&self) {
        self.timers.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_claim_due_moves_entries() {
        let queue = ExpiryQueue::new(Arc::new(MemoryKv::new()));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        queue.schedule("A", now - chrono::Duration::seconds(10)).await.unwrap();
        queue.schedule("B", now).await.unwrap();
        queue.schedule("C", now + chrono::Duration::seconds(1)).await.unwrap();

        let claimed = queue.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed, vec!["A".to_string(), "B".to_string()]);
        // second claim sees nothing
        assert!(queue.claim_due(now, 10).await.unwrap().is_empty());
        assert_eq!(
            queue.due_at("C").await.unwrap(),
            Some(now + chrono::Duration::seconds(1))
        );
    }

    /// Lets `zrem` succeed `budget` times, then fails it.
    struct FlakyZrem {
        inner: MemoryKv,
        budget: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KvStore for FlakyZrem {
        fn backend(&self) -> &'static str {
            "flaky"
        }
        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn exists(&self, key: &str) -> KvResult<bool> {
            self.inner.exists(key).await
        }
        async fn delete(&self, key: &str) -> KvResult<()> {
            self.inner.delete(key).await
        }
        async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
            self.inner.compare_and_delete(key, expected).await
        }
        async fn compare_and_expire(
            &self,
            key: &str,
            expected: &str,
            ttl: Duration,
        ) -> KvResult<bool> {
            self.inner.compare_and_expire(key, expected, ttl).await
        }
        async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
            self.inner.ttl(key).await
        }
        async fn zadd(&self, set: &str, member: &str, score: i64) -> KvResult<()> {
            self.inner.zadd(set, member, score).await
        }
        async fn zrange_by_score(
            &self,
            set: &str,
            min: i64,
            max: i64,
            limit: usize,
        ) -> KvResult<Vec<String>> {
            self.inner.zrange_by_score(set, min, max, limit).await
        }
        async fn zrem(&self, set: &str, member: &str) -> KvResult<bool> {
            let left = self.budget.load(Ordering::SeqCst);
            if left == 0 {
                return Err(crate::kv::KvError::Unavailable("connection reset".into()));
            }
            self.budget.store(left - 1, Ordering::SeqCst);
            self.inner.zrem(set, member).await
        }
        async fn zscore(&self, set: &str, member: &str) -> KvResult<Option<i64>> {
            self.inner.zscore(set, member).await
        }
        async fn ping(&self) -> KvResult<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_claim_keeps_entries_removed_before_failure() {
        let kv = Arc::new(FlakyZrem {
            inner: MemoryKv::new(),
            budget: AtomicUsize::new(2),
        });
        let queue = ExpiryQueue::new(kv);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        for (i, no) in ["A", "B", "C"].iter().enumerate() {
            queue
                .schedule(no, now - chrono::Duration::seconds(30 - i as i64))
                .await
                .unwrap();
        }

        let claimed = queue.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed, vec!["A".to_string(), "B".to_string()]);
        assert!(queue.due_at("C").await.unwrap().is_some());

        // Nothing claimed yet: the failure surfaces.
        assert!(queue.claim_due(now, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_respects_limit() {
        let queue = ExpiryQueue::new(Arc::new(MemoryKv::new()));
        let now = Utc::now();
        for i in 0..15 {
            queue
                .schedule(&format!("O{i:02}"), now - chrono::Duration::seconds(60 - i))
                .await
                .unwrap();
        }
        assert_eq!(queue.claim_due(now, 10).await.unwrap().len(), 10);
        assert_eq!(queue.claim_due(now, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_remove() {
        let queue = ExpiryQueue::new(Arc::new(MemoryKv::new()));
        queue.schedule("A", Utc::now()).await.unwrap();
        assert!(queue.remove("A").await.unwrap());
        assert!(!queue.remove("A").await.unwrap());
        assert_eq!(queue.due_at("A").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_timer_fires_once() {
        let timers = ExpiryTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timers.arm("A", Duration::from_millis(10), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[tokio::test]
    async fn test_disarmed_timer_never_fires() {
        let timers = ExpiryTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for no in ["A", "B"] {
            let f = fired.clone();
            timers.arm(no, Duration::from_millis(20), async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(timers.disarm("A"));
        assert!(!timers.disarm("A"));
        timers.disarm_all();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
