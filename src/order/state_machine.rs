//! Order State Machine
//!
//! The only writer of `orders.status`. A transition is:
//! lock `order_status_update:{no}` -> serializable tx -> row lock ->
//! validate -> history -> status -> side effects -> commit -> notify.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::lock::{self, LockHandle, LockManager, keys};
use crate::notify::{EventType, Notification, Notifier};
use crate::store::{Store, StoreTx, rollback_quietly};

use super::model::{LedgerKind, Order, StatusHistoryEntry};
use super::status::{self, Operator, OrderStatus};
use super::wallet::{self, Credit};

#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    /// Extra attempts after a serialization conflict.
    pub conflict_retries: u32,
    pub batch_budget: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_secs(10),
            conflict_retries: 3,
            batch_budget: Duration::from_secs(30),
        }
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub order: Order,
    pub from: OrderStatus,
    pub to: OrderStatus,
    /// False when the order already was in the target status.
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, EngineError)>,
}

pub struct StateMachine {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: StateMachineConfig,
}

impl StateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<LockManager>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: StateMachineConfig,
    ) -> Self {
        Self {
            store,
            locks,
            notifier,
            clock,
            config,
        }
    }

    pub fn allowed_transitions(from: OrderStatus, operator: Operator) -> Vec<OrderStatus> {
        status::allowed_transitions(from, operator)
    }

    pub fn validate_transition(
        from: OrderStatus,
        to: OrderStatus,
        operator: Operator,
    ) -> EngineResult<()> {
        status::validate_transition(from, to, operator)
    }

    /// Take the per-order transition lock.
    pub(crate) async fn lock_order(&self, order_no: &str) -> EngineResult<LockHandle> {
        self.locks
            .acquire_timeout(
                &keys::order_status_update(order_no),
                self.config.lock_ttl,
                self.config.lock_wait,
                false,
            )
            .await
    }

    /// Move `order_no` to `to` on behalf of `operator`.
    ///
    /// Already in `to`: success without side effects.
    pub async fn update_status(
        &self,
        order_no: &str,
        to: OrderStatus,
        operator: Operator,
        reason: &str,
    ) -> EngineResult<TransitionOutcome> {
        let handle = self.lock_order(order_no).await?;
        let result = self.apply_with_retry(order_no, to, operator, reason).await;
        lock::release_quietly(handle).await;

        let outcome = result?;
        if outcome.changed {
            info!(
                order_no = %order_no,
                from = %outcome.from,
                to = %outcome.to,
                operator = %operator,
                "Order status updated"
            );
            self.notify_transition(&outcome, reason);
        }
        Ok(outcome)
    }

    async fn apply_with_retry(
        &self,
        order_no: &str,
        to: OrderStatus,
        operator: Operator,
        reason: &str,
    ) -> EngineResult<TransitionOutcome> {
        let mut attempt = 0;
        loop {
            let mut tx = self.store.begin_serializable().await?;
            let now = self.clock.now();
            let result = match apply_in_tx(&mut *tx, order_no, to, operator, reason, now).await {
                Ok(outcome) => tx.commit().await.map(|_| outcome),
                Err(e) => {
                    rollback_quietly(tx).await;
                    Err(e)
                }
            };
            match result {
                Err(EngineError::OptimisticConflict(msg)) if attempt < self.config.conflict_retries => {
                    attempt += 1;
                    warn!(order_no = %order_no, attempt, error = %msg, "Serialization conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Apply per order; stop once the batch budget is spent.
    pub async fn batch_update_status(
        &self,
        order_nos: &[String],
        to: OrderStatus,
        operator: Operator,
        reason: &str,
    ) -> BatchOutcome {
        let deadline = tokio::time::Instant::now() + self.config.batch_budget;
        let mut outcome = BatchOutcome::default();

        for (i, order_no) in order_nos.iter().enumerate() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = order_nos.len() - i,
                    "Batch status update budget exhausted"
                );
                for rest in &order_nos[i..] {
                    outcome.failed.push((
                        rest.clone(),
                        EngineError::Timeout("batch budget exhausted".into()),
                    ));
                }
                break;
            }
            match self.update_status(order_no, to, operator, reason).await {
                Ok(_) => outcome.succeeded.push(order_no.clone()),
                Err(e) => outcome.failed.push((order_no.clone(), e)),
            }
        }

        info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            to = %to,
            "Batch status update finished"
        );
        outcome
    }

    pub(crate) fn notify_transition(&self, outcome: &TransitionOutcome, reason: &str) {
        let event = match outcome.to {
            OrderStatus::Paid => EventType::OrderPaid,
            OrderStatus::Cancelled => EventType::OrderCancelled,
            OrderStatus::Refunded => EventType::OrderRefunded,
            _ => EventType::OrderStatusChanged,
        };
        self.notifier.notify(Notification::new(
            outcome.order.user_id,
            outcome.order.order_no.clone(),
            event,
            serde_json::json!({
                "from": outcome.from,
                "to": outcome.to,
                "reason": reason,
                "total_amount": crate::money::format_amount(outcome.order.total_amount),
            }),
        ));
    }
}

/// Steps 2-7 of a transition inside the caller's transaction.
pub async fn apply_in_tx(
    tx: &mut dyn StoreTx,
    order_no: &str,
    to: OrderStatus,
    operator: Operator,
    reason: &str,
    at: DateTime<Utc>,
) -> EngineResult<TransitionOutcome> {
    let mut order = tx
        .order_for_update(order_no)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("order {order_no}")))?;
    let from = order.status;

    if from == to {
        return Ok(TransitionOutcome {
            order,
            from,
            to,
            changed: false,
        });
    }

    status::validate_transition(from, to, operator)?;

    tx.insert_history(StatusHistoryEntry {
        order_no: order_no.to_string(),
        from_status: from,
        to_status: to,
        operator,
        reason: reason.to_string(),
        created_at: at,
    })
    .await?;
    tx.set_order_status(order_no, to, at).await?;

    match to {
        OrderStatus::Cancelled => {
            if from == OrderStatus::Paid {
                refund_wallet(tx, &order, "order cancelled after payment", at).await?;
            }
            tx.restore_stock(order.goods_id, order.quantity).await?;
        }
        OrderStatus::Refunded => {
            tx.restore_stock(order.goods_id, order.quantity).await?;
            refund_wallet(tx, &order, "order refunded", at).await?;
        }
        OrderStatus::Paid
        | OrderStatus::Shipped
        | OrderStatus::Delivered
        | OrderStatus::Completed
        | OrderStatus::Pending => {}
    }

    order.status = to;
    order.updated_at = at;
    Ok(TransitionOutcome {
        order,
        from,
        to,
        changed: true,
    })
}

async fn refund_wallet(
    tx: &mut dyn StoreTx,
    order: &Order,
    description: &str,
    at: DateTime<Utc>,
) -> EngineResult<()> {
    wallet::credit(
        tx,
        Credit {
            user_id: order.user_id,
            amount: order.total_amount,
            kind: LedgerKind::SystemRefund,
            description,
            reference_no: Some(&order.order_no),
            ref_entry_id: None,
        },
        at,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::MemoryKv;
    use crate::notify::MemoryNotifier;
    use crate::order::model::{Goods, GoodsStatus, NewOrder};
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    struct Fixture {
        store: MemoryStore,
        notifier: Arc<MemoryNotifier>,
        sm: StateMachine,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        store
            .seed_goods(Goods {
                id: 1,
                merchant_id: 5,
                name: "pen".into(),
                unit_price: Decimal::new(1000, 2),
                stock: 8,
                status: GoodsStatus::Active,
                deleted: false,
            })
            .await;
        let notifier = Arc::new(MemoryNotifier::new());
        let sm = StateMachine::new(
            Arc::new(store.clone()),
            Arc::new(LockManager::new(Arc::new(MemoryKv::new()))),
            notifier.clone(),
            Arc::new(SystemClock),
            StateMachineConfig::default(),
        );
        Fixture { store, notifier, sm }
    }

    async fn seed_order(store: &MemoryStore, no: &str, status: OrderStatus) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(NewOrder {
            order_no: no.into(),
            user_id: 42,
            goods_id: 1,
            merchant_id: 5,
            quantity: 2,
            unit_price: Decimal::new(1000, 2),
            total_amount: Decimal::new(2000, 2),
            status,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_writes_history_and_notifies() {
        let f = fixture().await;
        seed_order(&f.store, "ORD1", OrderStatus::Paid).await;

        let out = f
            .sm
            .update_status("ORD1", OrderStatus::Shipped, Operator::Merchant, "shipped")
            .await
            .unwrap();
        assert!(out.changed);
        assert_eq!(out.order.status, OrderStatus::Shipped);

        let history = f.store.status_history("ORD1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, OrderStatus::Paid);
        assert_eq!(history[0].to_status, OrderStatus::Shipped);
        assert_eq!(history[0].operator, Operator::Merchant);
        assert_eq!(f.notifier.count(EventType::OrderStatusChanged), 1);
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let f = fixture().await;
        seed_order(&f.store, "ORD1", OrderStatus::Pending).await;

        let out = f
            .sm
            .update_status("ORD1", OrderStatus::Pending, Operator::User, "again")
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(f.store.status_history("ORD1").await.unwrap().is_empty());
        assert!(f.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_illegal_transition_rolls_back() {
        let f = fixture().await;
        seed_order(&f.store, "ORD1", OrderStatus::Pending).await;

        let err = f
            .sm
            .update_status("ORD1", OrderStatus::Shipped, Operator::Admin, "skip")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
        let order = f.store.get_order("ORD1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(f.store.status_history("ORD1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_restores_stock() {
        let f = fixture().await;
        seed_order(&f.store, "ORD1", OrderStatus::Pending).await;

        f.sm
            .update_status("ORD1", OrderStatus::Cancelled, Operator::User, "changed mind")
            .await
            .unwrap();
        assert_eq!(f.store.get_goods(1).await.unwrap().unwrap().stock, 10);
        // pending orders were never charged
        assert!(f.store.ledger_entries(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_cancel_of_paid_order_refunds() {
        let f = fixture().await;
        seed_order(&f.store, "ORD1", OrderStatus::Paid).await;

        f.sm
            .update_status("ORD1", OrderStatus::Cancelled, Operator::Admin, "out of stock")
            .await
            .unwrap();
        let wallet = f.store.get_wallet(42).await.unwrap().unwrap();
        assert_eq!(wallet.balance, Decimal::new(2000, 2));
        let ledger = f.store.ledger_entries(42).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].kind, LedgerKind::SystemRefund);
        assert!(ledger[0].is_consistent());
    }

    #[tokio::test]
    async fn test_refund_from_completed() {
        let f = fixture().await;
        seed_order(&f.store, "ORD1", OrderStatus::Completed).await;

        let err = f
            .sm
            .update_status("ORD1", OrderStatus::Refunded, Operator::User, "please")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));

        f.sm
            .update_status("ORD1", OrderStatus::Refunded, Operator::Admin, "exception")
            .await
            .unwrap();
        assert_eq!(f.store.get_goods(1).await.unwrap().unwrap().stock, 10);
        assert_eq!(
            f.store.get_wallet(42).await.unwrap().unwrap().balance,
            Decimal::new(2000, 2)
        );
        assert_eq!(f.notifier.count(EventType::OrderRefunded), 1);
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let f = fixture().await;
        let err = f
            .sm
            .update_status("NOPE", OrderStatus::Paid, Operator::System, "")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_collects_failures() {
        let f = fixture().await;
        seed_order(&f.store, "A", OrderStatus::Pending).await;
        seed_order(&f.store, "B", OrderStatus::Completed).await;
        seed_order(&f.store, "C", OrderStatus::Pending).await;

        let nos = vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()];
        let out = f
            .sm
            .batch_update_status(&nos, OrderStatus::Cancelled, Operator::Admin, "cleanup")
            .await;
        assert_eq!(out.succeeded, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(out.failed.len(), 2);
        assert_eq!(out.failed[0].0, "B");
        assert!(matches!(out.failed[1].1, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_budget() {
        let store = MemoryStore::new();
        let sm = StateMachine::new(
            Arc::new(store.clone()),
            Arc::new(LockManager::new(Arc::new(MemoryKv::new()))),
            Arc::new(MemoryNotifier::new()),
            Arc::new(SystemClock),
            StateMachineConfig {
                batch_budget: Duration::ZERO,
                ..StateMachineConfig::default()
            },
        );
        let out = sm
            .batch_update_status(&["X".to_string()], OrderStatus::Cancelled, Operator::Admin, "")
            .await;
        assert!(out.succeeded.is_empty());
        assert!(matches!(out.failed[0].1, EngineError::Timeout(_)));
    }
}
