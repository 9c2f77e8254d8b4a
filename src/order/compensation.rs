//! Compensation Sweeper
//!
//! Hourly repair pass for anomalies left by crashes between side effects:
//! payments without an order are refunded, paid orders without a payment
//! entry are reported, negative stock is clamped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::lock::{self, LockManager, keys};
use crate::core_types::LedgerId;
use crate::store::{Store, StoreTx, rollback_quietly};
use crate::worker::{Shutdown, sleep_or_shutdown};

use super::model::{LedgerEntry, LedgerKind};
use super::wallet::{self, Credit};

#[derive(Debug, Clone)]
pub struct CompensationConfig {
    pub interval: Duration,
    /// How far back to look for orphaned payments.
    pub payment_lookback: chrono::Duration,
    /// Tolerance between a payment entry and its order's creation time.
    pub match_window: chrono::Duration,
    /// How far back to look for paid orders without a payment entry.
    pub paid_lookback: chrono::Duration,
    pub lock_ttl: Duration,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            payment_lookback: chrono::Duration::hours(24),
            match_window: chrono::Duration::minutes(2),
            paid_lookback: chrono::Duration::hours(1),
            lock_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompensationReport {
    /// Ledger ids of the refunded payments.
    pub refunded: Vec<i64>,
    /// Order numbers flagged for manual review.
    pub flagged: Vec<String>,
    pub clamped_goods: Vec<i64>,
    /// Another instance held the sweep lock.
    pub skipped: bool,
}

pub struct CompensationSweeper {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    config: CompensationConfig,
}

impl CompensationSweeper {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        config: CompensationConfig,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(interval_secs = self.config.interval.as_secs(), "Starting compensation sweeper");
        loop {
            if sleep_or_shutdown(&mut shutdown, self.config.interval).await {
                break;
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Compensation sweep failed");
            }
        }
    }

    /// One pass. Only one instance sweeps at a time; the lock is renewed for
    /// as long as the pass runs.
    pub async fn sweep(&self) -> EngineResult<CompensationReport> {
        let handle = match self
            .locks
            .acquire_with_renewal(&keys::compensation_sweep(), self.config.lock_ttl)
            .await
        {
            Ok(h) => h,
            Err(EngineError::AlreadyHeld(_)) => {
                info!("Compensation sweep already running elsewhere");
                return Ok(CompensationReport {
                    skipped: true,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e),
        };

        let result = self.sweep_locked().await;
        lock::release_quietly(handle).await;
        let report = result?;

        if !report.refunded.is_empty() || !report.flagged.is_empty() || !report.clamped_goods.is_empty() {
            warn!(
                refunded = report.refunded.len(),
                flagged = report.flagged.len(),
                clamped = report.clamped_goods.len(),
                "Compensation sweep found anomalies"
            );
        } else {
            info!("Compensation sweep clean");
        }
        Ok(report)
    }

    async fn sweep_locked(&self) -> EngineResult<CompensationReport> {
        let now = self.clock.now();
        let mut report = CompensationReport::default();

        let orphans = self
            .store
            .orphaned_payments(now - self.config.payment_lookback, self.config.match_window)
            .await?;
        for entry in &orphans {
            match self.refund_orphan(entry, now).await {
                Ok(true) => report.refunded.push(entry.id),
                Ok(false) => debug!(ledger_id = entry.id, "Orphaned payment already refunded"),
                Err(e) => error!(ledger_id = entry.id, user_id = entry.user_id, error = %e, "Orphaned payment refund failed"),
            }
        }

        let unbacked = self
            .store
            .paid_orders_without_ledger(now - self.config.paid_lookback)
            .await?;
        for order in unbacked {
            warn!(
                order_no = %order.order_no,
                user_id = order.user_id,
                total = %order.total_amount,
                "Paid order has no payment ledger entry, manual review required"
            );
            report.flagged.push(order.order_no);
        }

        for goods in self.store.negative_stock_goods().await? {
            match self.clamp(goods.id).await {
                Ok(true) => {
                    error!(goods_id = goods.id, stock = goods.stock, "Negative stock clamped to zero");
                    report.clamped_goods.push(goods.id);
                }
                Ok(false) => {}
                Err(e) => error!(goods_id = goods.id, error = %e, "Stock clamp failed"),
            }
        }

        Ok(report)
    }

    /// `false` if a refund for `entry` was committed in the meantime.
    async fn refund_orphan(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> EngineResult<bool> {
        let mut tx = self.store.begin().await?;
        match refund_steps(&mut *tx, entry, now).await {
            Ok(None) => {
                rollback_quietly(tx).await;
                Ok(false)
            }
            Ok(Some(refund_id)) => {
                tx.commit().await?;
                warn!(
                    ledger_id = entry.id,
                    refund_id,
                    user_id = entry.user_id,
                    amount = %entry.amount,
                    "Orphaned payment refunded"
                );
                Ok(true)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn clamp(&self, goods_id: i64) -> EngineResult<bool> {
        let mut tx = self.store.begin().await?;
        match tx.clamp_negative_stock(goods_id).await {
            Ok(changed) => {
                tx.commit().await?;
                Ok(changed)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }
}

async fn refund_steps(
    tx: &mut dyn StoreTx,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> EngineResult<Option<LedgerId>> {
    if tx.refund_exists(entry.id).await? {
        return Ok(None);
    }
    let refund_id = wallet::credit(
        tx,
        Credit {
            user_id: entry.user_id,
            amount: entry.amount,
            kind: LedgerKind::SystemRefund,
            description: "compensation: payment without order",
            reference_no: entry.reference_no.as_deref(),
            ref_entry_id: Some(entry.id),
        },
        now,
    )
    .await?;
    Ok(Some(refund_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::{KvStore, MemoryKv};
    use crate::order::model::{Goods, GoodsStatus, NewLedgerEntry, NewOrder};
    use crate::order::status::OrderStatus;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    fn sweeper(store: &MemoryStore, locks: Arc<LockManager>) -> CompensationSweeper {
        CompensationSweeper::new(
            Arc::new(store.clone()),
            locks,
            Arc::new(SystemClock),
            CompensationConfig::default(),
        )
    }

    async fn orphan_payment(store: &MemoryStore, user_id: i64, amount: Decimal) {
        let mut tx = store.begin().await.unwrap();
        tx.debit_wallet(user_id, amount, Utc::now()).await.unwrap();
        tx.insert_ledger(NewLedgerEntry {
            user_id,
            kind: LedgerKind::OrderPayment,
            amount,
            balance_before: Decimal::from(100),
            balance_after: Decimal::from(100) - amount,
            description: "order payment".into(),
            reference_no: Some("ORDLOST".into()),
            ref_entry_id: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_orphaned_payment_refunded_once() {
        let store = MemoryStore::new();
        store.seed_wallet(1, Decimal::from(100)).await;
        orphan_payment(&store, 1, Decimal::from(30)).await;

        let locks = Arc::new(LockManager::new(Arc::new(MemoryKv::new())));
        let s = sweeper(&store, locks);

        let report = s.sweep().await.unwrap();
        assert_eq!(report.refunded.len(), 1);
        let t = store.snapshot().await;
        assert_eq!(t.wallets[&1].balance, Decimal::from(100));
        let refund = t.ledger.iter().find(|e| e.kind == LedgerKind::SystemRefund).unwrap();
        assert_eq!(refund.ref_entry_id, Some(report.refunded[0]));

        // second pass sees it as compensated
        let again = s.sweep().await.unwrap();
        assert!(again.refunded.is_empty());
    }

    #[tokio::test]
    async fn test_negative_stock_clamped() {
        let store = MemoryStore::new();
        store
            .seed_goods(Goods {
                id: 9,
                merchant_id: 1,
                name: "broken".into(),
                unit_price: Decimal::from(5),
                stock: -3,
                status: GoodsStatus::Active,
                deleted: false,
            })
            .await;
        let locks = Arc::new(LockManager::new(Arc::new(MemoryKv::new())));

        let report = sweeper(&store, locks).sweep().await.unwrap();
        assert_eq!(report.clamped_goods, vec![9]);
        assert_eq!(store.snapshot().await.goods[&9].stock, 0);
    }

    #[tokio::test]
    async fn test_skips_when_sweep_lock_held() {
        let store = MemoryStore::new();
        let locks = Arc::new(LockManager::new(Arc::new(MemoryKv::new())));
        let _held = locks
            .acquire(&keys::compensation_sweep(), Duration::from_secs(30))
            .await
            .unwrap();

        let report = sweeper(&store, Arc::clone(&locks)).sweep().await.unwrap();
        assert!(report.skipped);
    }

    async fn paid_order(store: &MemoryStore, order_no: &str, user_id: i64, amount: Decimal) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(NewOrder {
            order_no: order_no.into(),
            user_id,
            goods_id: 1,
            merchant_id: 1,
            quantity: 1,
            unit_price: amount,
            total_amount: amount,
            status: OrderStatus::Paid,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_paid_order_without_ledger_only_flagged() {
        let store = MemoryStore::new();
        store.seed_wallet(1, Decimal::from(100)).await;
        paid_order(&store, "ORDX", 1, Decimal::from(40)).await;
        let locks = Arc::new(LockManager::new(Arc::new(MemoryKv::new())));

        let report = sweeper(&store, locks).sweep().await.unwrap();
        assert_eq!(report.flagged, vec!["ORDX".to_string()]);
        assert!(report.refunded.is_empty());

        let t = store.snapshot().await;
        assert_eq!(t.wallets[&1].balance, Decimal::from(100));
        assert!(t.ledger.is_empty());
        assert_eq!(t.order("ORDX").unwrap().status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_payment_with_matching_order_left_alone() {
        let store = MemoryStore::new();
        store.seed_wallet(1, Decimal::from(100)).await;
        paid_order(&store, "ORDLOST", 1, Decimal::from(30)).await;
        orphan_payment(&store, 1, Decimal::from(30)).await;
        let locks = Arc::new(LockManager::new(Arc::new(MemoryKv::new())));

        let report = sweeper(&store, locks).sweep().await.unwrap();
        assert!(report.refunded.is_empty());
        assert!(report.flagged.is_empty());
        assert_eq!(store.snapshot().await.wallets[&1].balance, Decimal::from(70));
    }

    #[tokio::test]
    async fn test_refund_rechecked_inside_transaction() {
        let store = MemoryStore::new();
        store.seed_wallet(1, Decimal::from(100)).await;
        orphan_payment(&store, 1, Decimal::from(30)).await;
        let locks = Arc::new(LockManager::new(Arc::new(MemoryKv::new())));
        let s = sweeper(&store, locks);

        // Both passes saw the entry as orphaned before either refunded it.
        let entry = store.snapshot().await.ledger[0].clone();
        assert!(s.refund_orphan(&entry, Utc::now()).await.unwrap());
        assert!(!s.refund_orphan(&entry, Utc::now()).await.unwrap());

        let t = store.snapshot().await;
        assert_eq!(t.wallets[&1].balance, Decimal::from(100));
        assert_eq!(
            t.ledger.iter().filter(|e| e.kind == LedgerKind::SystemRefund).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweep_lock_released_after_pass() {
        let store = MemoryStore::new();
        let kv = Arc::new(MemoryKv::new());
        let locks = Arc::new(LockManager::new(kv.clone()));

        let report = sweeper(&store, locks).sweep().await.unwrap();
        assert!(!report.skipped);
        assert!(!kv.exists("lock:compensation:sweep").await.unwrap());
    }
}
