//! Distributed Lock Manager
//!
//! Named mutual exclusion across processes on top of a [`KvStore`].
//!
//! - acquire = atomic set-if-absent with TTL, value = 128-bit holder token
//! - release = compare-and-delete (never removes another holder's lock)
//! - renewal = compare-and-extend every `ttl / 3` while the token still matches
//!
//! Per-process state lives on the `LockManager` instance; there is no global
//! registry of held locks.

pub mod keys;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::kv::{KvError, KvStore};

pub const DEFAULT_PREFIX: &str = "lock:";

/// Held locks whose remaining TTL is below this are waited out once
/// instead of polled.
const SHORT_TTL_WAIT: Duration = Duration::from_secs(5);

pub struct LockManager {
    kv: Arc<dyn KvStore>,
    prefix: String,
    retry_interval: Duration,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            prefix: DEFAULT_PREFIX.to_string(),
            retry_interval: Duration::from_millis(50),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Single attempt. `AlreadyHeld` if someone else owns `key`.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> EngineResult<LockHandle> {
        self.try_acquire(key, ttl, false).await
    }

    /// Single attempt; on success a background task keeps extending the TTL
    /// until the handle is released or ownership is lost.
    pub async fn acquire_with_renewal(&self, key: &str, ttl: Duration) -> EngineResult<LockHandle> {
        self.try_acquire(key, ttl, true).await
    }

    /// Retry until `wait` elapses. Exhaustion maps to `SystemBusy`;
    /// backend failures are returned immediately.
    pub async fn acquire_timeout(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
        renew: bool,
    ) -> EngineResult<LockHandle> {
        let deadline = tokio::time::Instant::now() + wait;
        let full = self.full_key(key);
        let mut waited_out = false;

        loop {
            match self.try_acquire(key, ttl, renew).await {
                Ok(handle) => return Ok(handle),
                Err(EngineError::AlreadyHeld(_)) => {}
                Err(e) => return Err(e),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(key = %full, "Lock wait exhausted");
                return Err(EngineError::SystemBusy(format!("lock {key} is held")));
            }

            // A holder about to expire: sleep past its TTL once.
            let mut pause = self.retry_interval;
            if !waited_out {
                if let Ok(Some(remaining)) = self.kv.ttl(&full).await {
                    if remaining < SHORT_TTL_WAIT {
                        pause = remaining + Duration::from_millis(100);
                        waited_out = true;
                    }
                }
            }
            tokio::time::sleep(pause.min(deadline - now)).await;
        }
    }

    async fn try_acquire(&self, key: &str, ttl: Duration, renew: bool) -> EngineResult<LockHandle> {
        let full = self.full_key(key);
        let token = new_token();

        let created = self
            .kv
            .set_nx(&full, &token, ttl)
            .await
            .map_err(|e| EngineError::LockBackendUnavailable(e.to_string()))?;
        if !created {
            return Err(EngineError::AlreadyHeld(key.to_string()));
        }

        debug!(key = %full, ttl_ms = ttl.as_millis() as u64, renew, "Lock acquired");

        let lost = Arc::new(AtomicBool::new(false));
        let renewal = renew.then(|| {
            spawn_renewal(
                Arc::clone(&self.kv),
                full.clone(),
                token.clone(),
                ttl,
                Arc::clone(&lost),
            )
        });

        Ok(LockHandle {
            kv: Arc::clone(&self.kv),
            key: full,
            token,
            ttl,
            renewal,
            lost,
            released: false,
        })
    }
}

/// 128-bit random holder token, hex encoded.
fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct Renewal {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

fn spawn_renewal(
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) -> Renewal {
    let (stop, mut stop_rx) = oneshot::channel::<()>();
    let interval = (ttl / 3).max(Duration::from_millis(10));

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(interval) => {
                    match kv.compare_and_expire(&key, &token, ttl).await {
                        Ok(true) => debug!(key = %key, "Lock renewed"),
                        Ok(false) => {
                            warn!(key = %key, "Lock ownership lost, renewal stopped");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => warn!(key = %key, error = %e, "Lock renewal failed, will retry"),
                    }
                }
            }
        }
    });

    Renewal { stop, task }
}

/// Proof of holding a lock.
///
/// Always `release().await` explicitly. Dropping an unreleased handle stops
/// renewal and schedules a best-effort compare-and-delete on the runtime.
pub struct LockHandle {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    ttl: Duration,
    renewal: Option<Renewal>,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Renewal observed another holder (or no holder) under our key.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Returns true if the key was still ours and has been deleted.
    pub async fn release(mut self) -> Result<bool, KvError> {
        self.stop_renewal().await;
        self.released = true;
        let removed = self.kv.compare_and_delete(&self.key, &self.token).await?;
        if removed {
            debug!(key = %self.key, "Lock released");
        } else {
            warn!(key = %self.key, "Lock was no longer held at release");
        }
        Ok(removed)
    }

    async fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            let _ = renewal.stop.send(());
            let _ = renewal.task.await;
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(renewal) = self.renewal.take() {
            renewal.task.abort();
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let kv = Arc::clone(&self.kv);
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            rt.spawn(async move {
                if let Err(e) = kv.compare_and_delete(&key, &token).await {
                    warn!(key = %key, error = %e, "Dropped lock handle could not release");
                }
            });
        }
    }
}

/// Release and log; lock release failures never fail the caller.
pub async fn release_quietly(handle: LockHandle) {
    let key = handle.key().to_string();
    if let Err(e) = handle.release().await {
        warn!(key = %key, error = %e, "Lock release failed, TTL will expire it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn manager() -> (Arc<MemoryKv>, LockManager) {
        let kv = Arc::new(MemoryKv::new());
        let mgr = LockManager::new(kv.clone()).with_retry_interval(Duration::from_millis(5));
        (kv, mgr)
    }

    #[tokio::test]
    async fn test_acquire_then_already_held() {
        let (_kv, mgr) = manager();
        let h = mgr.acquire("a", Duration::from_secs(5)).await.unwrap();
        assert_eq!(h.token().len(), 32);

        let err = mgr.acquire("a", Duration::from_secs(5)).await.err().unwrap();
        assert!(matches!(err, EngineError::AlreadyHeld(_)));

        assert!(h.release().await.unwrap());
        let h2 = mgr.acquire("a", Duration::from_secs(5)).await.unwrap();
        release_quietly(h2).await;
    }

    #[tokio::test]
    async fn test_release_never_removes_foreign_lock() {
        let (kv, mgr) = manager();
        let h = mgr.acquire("a", Duration::from_millis(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Expired, taken over by another holder.
        let other = mgr.acquire("a", Duration::from_secs(5)).await.unwrap();
        assert!(!h.release().await.unwrap());
        assert_eq!(
            kv.get("lock:a").await.unwrap().as_deref(),
            Some(other.token())
        );
        release_quietly(other).await;
    }

    #[tokio::test]
    async fn test_renewal_keeps_lock_alive() {
        let (kv, mgr) = manager();
        let h = mgr
            .acquire_with_renewal("long", Duration::from_millis(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(kv.exists("lock:long").await.unwrap());
        assert!(!h.is_lost());
        assert!(h.release().await.unwrap());
        assert!(!kv.exists("lock:long").await.unwrap());
    }

    #[tokio::test]
    async fn test_renewal_detects_ownership_loss() {
        let (kv, mgr) = manager();
        let h = mgr
            .acquire_with_renewal("x", Duration::from_millis(60))
            .await
            .unwrap();
        kv.set("lock:x", "someone-else", Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.is_lost());
        assert!(!h.release().await.unwrap());
        assert_eq!(
            kv.get("lock:x").await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn test_acquire_timeout_maps_to_system_busy() {
        let (_kv, mgr) = manager();
        let h = mgr.acquire("busy", Duration::from_secs(30)).await.unwrap();
        let err = mgr
            .acquire_timeout("busy", Duration::from_secs(30), Duration::from_millis(40), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::SystemBusy(_)));
        release_quietly(h).await;
    }

    #[tokio::test]
    async fn test_acquire_timeout_succeeds_after_release() {
        let (_kv, mgr) = manager();
        let mgr = Arc::new(mgr);
        let h = mgr.acquire("k", Duration::from_secs(30)).await.unwrap();

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.acquire_timeout("k", Duration::from_secs(30), Duration::from_secs(2), false)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        release_quietly(h).await;

        let h2 = waiter.await.unwrap().unwrap();
        release_quietly(h2).await;
    }

    #[tokio::test]
    async fn test_backend_unavailable() {
        let (kv, mgr) = manager();
        kv.set_available(false);
        let err = mgr.acquire("k", Duration::from_secs(1)).await.err().unwrap();
        assert!(matches!(err, EngineError::LockBackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let (kv, mgr) = manager();
        {
            let _h = mgr.acquire("d", Duration::from_secs(30)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!kv.exists("lock:d").await.unwrap());
    }
}
