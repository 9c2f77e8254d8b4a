//! In-process key-value backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{KvError, KvResult, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// DashMap-backed store with TTL and sorted sets.
///
/// `set_available(false)` makes every call fail with `KvError::Unavailable`,
/// which is how tests simulate a Redis outage.
#[derive(Debug, Default)]
pub struct MemoryKv {
    strings: DashMap<String, Entry>,
    zsets: Mutex<HashMap<String, HashMap<String, i64>>>,
    unavailable: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> KvResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(KvError::Unavailable("memory kv switched off".into()))
        } else {
            Ok(())
        }
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.strings.get(key).map(|e| e.clone())?;
        if entry.is_live(now) {
            Some(entry)
        } else {
            self.strings.remove_if(key, |_, e| !e.is_live(now));
            None
        }
    }

    fn zsets(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, i64>>> {
        self.zsets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut created = false;
        self.strings
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    e.value = value.to_string();
                    e.expires_at = Some(now + ttl);
                    created = true;
                }
            })
            .or_insert_with(|| {
                created = true;
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                }
            });
        Ok(created)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.check()?;
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.check()?;
        Ok(self.live(key).map(|e| e.value))
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        self.check()?;
        Ok(self.live(key).is_some())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.check()?;
        self.strings.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .strings
            .remove_if(key, |_, e| e.is_live(now) && e.value == expected)
            .is_some())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> KvResult<bool> {
        self.check()?;
        let now = Instant::now();
        match self.strings.get_mut(key) {
            Some(mut e) if e.is_live(now) && e.value == expected => {
                e.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn zadd(&self, set: &str, member: &str, score: i64) -> KvResult<()> {
        self.check()?;
        self.zsets()
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> KvResult<Vec<String>> {
        self.check()?;
        let zsets = self.zsets();
        let Some(members) = zsets.get(set) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(&String, i64)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(hits.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, set: &str, member: &str) -> KvResult<bool> {
        self.check()?;
        Ok(self
            .zsets()
            .get_mut(set)
            .is_some_and(|members| members.remove(member).is_some()))
    }

    async fn zscore(&self, set: &str, member: &str) -> KvResult<Option<i64>> {
        self.check()?;
        Ok(self.zsets().get(set).and_then(|m| m.get(member).copied()))
    }

    async fn ping(&self) -> KvResult<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_nx("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_set_nx_after_expiry() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("k", "a", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!kv.exists("k").await.unwrap());
        assert!(kv.set_nx("k", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let kv = MemoryKv::new();
        kv.set("k", "owner", Duration::from_secs(5)).await.unwrap();
        assert!(!kv.compare_and_delete("k", "intruder").await.unwrap());
        assert!(kv.exists("k").await.unwrap());
        assert!(kv.compare_and_delete("k", "owner").await.unwrap());
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_expire() {
        let kv = MemoryKv::new();
        kv.set("k", "owner", Duration::from_millis(50)).await.unwrap();
        assert!(!kv.compare_and_expire("k", "x", Duration::from_secs(5)).await.unwrap());
        assert!(kv.compare_and_expire("k", "owner", Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sorted_set_range_and_remove() {
        let kv = MemoryKv::new();
        kv.zadd("q", "c", 30).await.unwrap();
        kv.zadd("q", "a", 10).await.unwrap();
        kv.zadd("q", "b", 20).await.unwrap();

        let due = kv.zrange_by_score("q", 0, 25, 10).await.unwrap();
        assert_eq!(due, vec!["a".to_string(), "b".to_string()]);

        let limited = kv.zrange_by_score("q", 0, 100, 1).await.unwrap();
        assert_eq!(limited, vec!["a".to_string()]);

        assert!(kv.zrem("q", "a").await.unwrap());
        assert!(!kv.zrem("q", "a").await.unwrap());
        assert_eq!(kv.zscore("q", "b").await.unwrap(), Some(20));
        assert_eq!(kv.zscore("q", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let kv = MemoryKv::new();
        kv.set_available(false);
        assert!(matches!(kv.ping().await, Err(KvError::Unavailable(_))));
        assert!(kv.set_nx("k", "v", Duration::from_secs(1)).await.is_err());
        kv.set_available(true);
        assert!(kv.ping().await.is_ok());
    }
}
