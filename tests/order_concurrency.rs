//! End-to-end order engine scenarios on the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use orderflow::clock::{Clock, ManualClock};
use orderflow::config::{ExpiryConfig, OrderConfig};
use orderflow::error::EngineError;
use orderflow::expiry::worker::{DbPoller, DbPollerConfig, QueueWorker, QueueWorkerConfig};
use orderflow::idempotency::IdempotencyGuard;
use orderflow::kv::MemoryKv;
use orderflow::lock::{LockManager, keys};
use orderflow::notify::{EventType, MemoryNotifier};
use orderflow::order::{
    CancelOutcome, CreateOrderRequest, EngineDeps, Goods, GoodsStatus, LedgerKind, ListQuery,
    MerchantCounters, Operator, OrderEngine, OrderStatus,
};
use orderflow::store::MemoryStore;

const GOODS: i64 = 100;

struct Harness {
    store: MemoryStore,
    kv: Arc<MemoryKv>,
    clock: Arc<ManualClock>,
    notifier: Arc<MemoryNotifier>,
    engine: Arc<OrderEngine>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

async fn harness_with(order: OrderConfig) -> Harness {
    let store = MemoryStore::new();
    store
        .seed_goods(Goods {
            id: GOODS,
            merchant_id: 9,
            name: "Coffee beans".into(),
            unit_price: Decimal::new(1250, 2),
            stock: 10,
            status: GoodsStatus::Active,
            deleted: false,
        })
        .await;
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::new(start()));
    let notifier = Arc::new(MemoryNotifier::new());
    let locks = Arc::new(LockManager::new(kv.clone()).with_retry_interval(Duration::from_millis(2)));
    let engine = OrderEngine::new(
        EngineDeps {
            store: Arc::new(store.clone()),
            kv: kv.clone(),
            locks,
            notifier: notifier.clone(),
            stats: Arc::new(MerchantCounters),
            clock: clock.clone(),
        },
        order,
        ExpiryConfig {
            enable_timers: false,
            ..ExpiryConfig::default()
        },
    );
    Harness {
        store,
        kv,
        clock,
        notifier,
        engine,
    }
}

async fn harness() -> Harness {
    harness_with(OrderConfig {
        lock_wait_secs: 30,
        ..OrderConfig::default()
    })
    .await
}

fn buy(quantity: i32) -> CreateOrderRequest {
    CreateOrderRequest {
        goods_id: GOODS,
        quantity,
    }
}

async fn stock(h: &Harness) -> i32 {
    h.store.snapshot().await.goods[&GOODS].stock
}

// ============================================================================
// Concurrent scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_s1_hundred_buyers_ten_units() {
    let h = harness().await;

    let mut tasks = Vec::new();
    for user in 1..=100 {
        let engine = Arc::clone(&h.engine);
        tasks.push(tokio::spawn(async move { engine.create_order(user, buy(1)).await }));
    }

    let mut ok = 0;
    let mut out_of_stock = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InsufficientStock { .. }) => out_of_stock += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 10);
    assert_eq!(out_of_stock, 90);
    assert_eq!(stock(&h).await, 0);

    let snap = h.store.snapshot().await;
    assert_eq!(snap.orders.len(), 10);
    assert_eq!(snap.merchant_stats[&9].order_count, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_s2_expiry_races_manual_cancel() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(2)).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    h.clock.advance(chrono::Duration::minutes(16));

    let e1 = Arc::clone(&h.engine);
    let no1 = order.order_no.clone();
    let expiry = tokio::spawn(async move { e1.cancel_expired_order(&no1).await });
    let e2 = Arc::clone(&h.engine);
    let no2 = order.order_no.clone();
    let manual = tokio::spawn(async move { e2.cancel_order(1, &no2).await });

    let expiry = expiry.await.unwrap().unwrap();
    let manual = manual.await.unwrap().unwrap();
    assert!(matches!(
        expiry,
        CancelOutcome::Cancelled | CancelOutcome::NotPending(OrderStatus::Cancelled)
    ));
    assert_eq!(manual.order.status, OrderStatus::Cancelled);
    // exactly one of them committed the change
    assert_eq!(
        (expiry == CancelOutcome::Cancelled) as u8 + manual.changed as u8,
        1
    );

    let snap = h.store.snapshot().await;
    let history: Vec<_> = snap
        .history
        .iter()
        .filter(|e| e.order_no == order.order_no)
        .collect();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_status, OrderStatus::Pending);
    assert_eq!(history[0].to_status, OrderStatus::Cancelled);
    assert_eq!(stock(&h).await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_s3_double_payment() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(2)).await.unwrap();
    assert_eq!(order.total_amount, Decimal::new(2500, 2));

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&h.engine);
        let no = order.order_no.clone();
        tasks.push(tokio::spawn(async move {
            engine.pay_order(&no, Decimal::new(2500, 2)).await
        }));
    }
    let mut paid = 0;
    let mut invalid = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.to, OrderStatus::Paid);
                paid += 1;
            }
            Err(EngineError::InvalidState(_)) => invalid += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((paid, invalid), (1, 1));

    // a paid order leaves the expiry queue and ignores later expiry
    assert!(h.engine.expiry_queue().due_at(&order.order_no).await.unwrap().is_none());
    h.clock.advance(chrono::Duration::minutes(30));
    assert_eq!(
        h.engine.cancel_expired_order(&order.order_no).await.unwrap(),
        CancelOutcome::NotPending(OrderStatus::Paid)
    );
}

#[tokio::test]
async fn test_s4_duplicate_submission_until_expiry() {
    let h = harness().await;
    let first = h.engine.create_order(1, buy(1)).await.unwrap();

    let err = h.engine.create_order(1, buy(1)).await.unwrap_err();
    assert_eq!(err, EngineError::DuplicateSubmission);

    h.clock.advance(chrono::Duration::minutes(16));
    let worker = QueueWorker::new(Arc::clone(&h.engine), QueueWorkerConfig::default());
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(
        h.store.snapshot().await.order(&first.order_no).unwrap().status,
        OrderStatus::Cancelled
    );
    assert_eq!(h.notifier.count(EventType::OrderExpired), 1);

    let third = h.engine.create_order(1, buy(1)).await.unwrap();
    assert_ne!(third.order_no, first.order_no);
}

// ============================================================================
// Laws
// ============================================================================

#[tokio::test]
async fn test_l1_cancel_is_idempotent() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(3)).await.unwrap();
    assert_eq!(stock(&h).await, 7);

    for _ in 0..5 {
        let outcome = h.engine.cancel_order(1, &order.order_no).await.unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    }
    for _ in 0..3 {
        h.engine.cancel_expired_order(&order.order_no).await.unwrap();
    }

    assert_eq!(stock(&h).await, 10);
    let history = h.engine.status_history(&order.order_no).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(h.notifier.count(EventType::OrderCancelled), 1);
}

#[tokio::test]
async fn test_l2_same_status_is_noop() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(1)).await.unwrap();
    let outcome = h
        .engine
        .update_status(&order.order_no, OrderStatus::Pending, Operator::Admin, "noop")
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert!(h.engine.status_history(&order.order_no).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_l3_insufficient_stock_leaves_no_trace() {
    let h = harness().await;
    let before = h.store.snapshot().await;

    let err = h.engine.create_order(1, buy(11)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientStock {
            available: 10,
            requested: 11
        }
    );

    let after = h.store.snapshot().await;
    assert_eq!(after.goods[&GOODS].stock, before.goods[&GOODS].stock);
    assert!(after.orders.is_empty());
    assert!(after.ledger.is_empty());

    let guard = IdempotencyGuard::new(h.kv.clone(), Default::default());
    let key = guard.order_create_key(1, GOODS, h.clock.now());
    assert!(!guard.check_only(&key).await.unwrap());

    // no mark: a smaller retry in the same bucket goes through
    h.engine.create_order(1, buy(10)).await.unwrap();
}

// ============================================================================
// Invariants
// ============================================================================

#[tokio::test]
async fn test_wallet_covers_total_pays_at_create() {
    let h = harness().await;
    h.store.seed_wallet(1, Decimal::from(100)).await;

    let order = h.engine.create_order(1, buy(4)).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert!(h.engine.expiry_queue().due_at(&order.order_no).await.unwrap().is_none());

    let snap = h.store.snapshot().await;
    assert_eq!(snap.wallets[&1].balance, Decimal::from(50));
    assert_eq!(snap.ledger.len(), 1);
    let entry = &snap.ledger[0];
    assert_eq!(entry.kind, LedgerKind::OrderPayment);
    assert_eq!(entry.amount, Decimal::from(50));
    assert!(entry.is_consistent());
}

#[tokio::test]
async fn test_refund_restores_stock_and_wallet() {
    let h = harness().await;
    h.store.seed_wallet(1, Decimal::from(100)).await;
    let order = h.engine.create_order(1, buy(2)).await.unwrap();

    h.engine
        .update_status(&order.order_no, OrderStatus::Shipped, Operator::Merchant, "shipped")
        .await
        .unwrap();
    h.engine
        .refund_order(&order.order_no, Operator::Admin, "damaged")
        .await
        .unwrap();

    let snap = h.store.snapshot().await;
    assert_eq!(snap.goods[&GOODS].stock, 10);
    assert_eq!(snap.wallets[&1].balance, Decimal::from(100));
    assert!(snap.ledger.iter().all(|e| e.is_consistent()));
    assert_eq!(h.engine.status_history(&order.order_no).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_illegal_transition_rejected() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(1)).await.unwrap();
    let err = h
        .engine
        .update_status(&order.order_no, OrderStatus::Shipped, Operator::Merchant, "early")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
    let err = h
        .engine
        .update_status(&order.order_no, OrderStatus::Completed, Operator::User, "skip ahead")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
}

#[tokio::test]
async fn test_create_is_all_or_nothing() {
    let h = harness().await;
    h.store.seed_wallet(1, Decimal::from(100)).await;
    h.store.fail_on("insert_order");

    assert!(h.engine.create_order(1, buy(2)).await.is_err());
    let snap = h.store.snapshot().await;
    assert_eq!(snap.goods[&GOODS].stock, 10);
    assert_eq!(snap.wallets[&1].balance, Decimal::from(100));
    assert!(snap.ledger.is_empty());
    assert!(snap.orders.is_empty());
}

#[tokio::test]
async fn test_stats_failure_does_not_fail_order() {
    let h = harness().await;
    h.store.fail_on("record_merchant_stats");
    let order = h.engine.create_order(1, buy(1)).await.unwrap();
    assert!(h.store.snapshot().await.order(&order.order_no).is_some());
}

#[tokio::test]
async fn test_pay_amount_mismatch() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(1)).await.unwrap();
    let err = h
        .engine
        .pay_order(&order.order_no, Decimal::new(1000, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AmountMismatch { .. }));
    let err = h.engine.pay_order(&order.order_no, Decimal::ZERO).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_lock_backend_down_degrades() {
    let h = harness().await;
    h.kv.set_available(false);

    let order = h.engine.create_order(1, buy(1)).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(stock(&h).await, 9);

    // payment needs its lock
    let err = h
        .engine
        .pay_order(&order.order_no, Decimal::new(1250, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LockBackendUnavailable(_)));
}

#[tokio::test]
async fn test_lock_backend_down_without_degradation() {
    let h = harness_with(OrderConfig {
        degrade_without_locks: false,
        ..OrderConfig::default()
    })
    .await;
    h.kv.set_available(false);
    let err = h.engine.create_order(1, buy(1)).await.unwrap_err();
    assert!(matches!(err, EngineError::LockBackendUnavailable(_)));
    assert_eq!(stock(&h).await, 10);
}

// ============================================================================
// Expiry layers
// ============================================================================

#[tokio::test]
async fn test_queue_requeues_on_lock_contention() {
    let h = harness_with(OrderConfig {
        cancel_lock_wait_secs: 0,
        ..OrderConfig::default()
    })
    .await;
    let order = h.engine.create_order(1, buy(1)).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(16));

    let other = LockManager::new(h.kv.clone());
    let _held = other
        .acquire(&keys::cancel_order(&order.order_no), Duration::from_secs(30))
        .await
        .unwrap();

    let worker = QueueWorker::new(Arc::clone(&h.engine), QueueWorkerConfig::default());
    assert_eq!(worker.tick().await.unwrap(), 0);
    let due = h
        .engine
        .expiry_queue()
        .due_at(&order.order_no)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(due, h.clock.now() + chrono::Duration::minutes(5));
}

#[tokio::test]
async fn test_db_poller_catches_lost_queue_entry() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(1)).await.unwrap();
    h.engine.expiry_queue().remove(&order.order_no).await.unwrap();

    let poller = DbPoller::new(Arc::clone(&h.engine), DbPollerConfig::default());
    h.clock.advance(chrono::Duration::minutes(14));
    assert_eq!(poller.scan_and_cancel().await.unwrap(), 0);

    h.clock.advance(chrono::Duration::minutes(2));
    assert_eq!(poller.scan_and_cancel().await.unwrap(), 1);
    assert_eq!(stock(&h).await, 10);
}

#[tokio::test(start_paused = true)]
async fn test_in_process_timer_cancels() {
    let store = MemoryStore::new();
    store
        .seed_goods(Goods {
            id: GOODS,
            merchant_id: 9,
            name: "Tea".into(),
            unit_price: Decimal::ONE,
            stock: 5,
            status: GoodsStatus::Active,
            deleted: false,
        })
        .await;
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::new(start()));
    let engine = OrderEngine::new(
        EngineDeps {
            store: Arc::new(store.clone()),
            kv: kv.clone(),
            locks: Arc::new(LockManager::new(kv.clone())),
            notifier: Arc::new(MemoryNotifier::new()),
            stats: Arc::new(MerchantCounters),
            clock: clock.clone(),
        },
        OrderConfig::default(),
        ExpiryConfig::default(),
    );

    let order = engine.create_order(1, buy(1)).await.unwrap();
    assert_eq!(engine.timers().len(), 1);

    clock.advance(chrono::Duration::minutes(17));
    tokio::time::sleep(Duration::from_secs(17 * 60 + 1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        store.snapshot().await.order(&order.order_no).unwrap().status,
        OrderStatus::Cancelled
    );
    assert!(engine.timers().is_empty());
}

// ============================================================================
// Queries and wallet
// ============================================================================

#[tokio::test]
async fn test_owner_only_queries() {
    let h = harness().await;
    let order = h.engine.create_order(1, buy(1)).await.unwrap();

    let view = h.engine.get_order(1, order.id).await.unwrap();
    assert_eq!(view.total_amount, "12.50");
    assert!(matches!(
        h.engine.get_order(2, order.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.cancel_order(2, &order.order_no).await,
        Err(EngineError::Forbidden(_))
    ));

    let page = h
        .engine
        .list_my_orders(1, ListQuery {
            page: Some(1),
            page_size: Some(500),
            status: Some(OrderStatus::Pending),
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.page_size, 100);
}

#[tokio::test]
async fn test_recharge_then_buy() {
    let h = harness().await;
    assert_eq!(h.engine.wallet(1).await.unwrap().balance, Decimal::ZERO);

    let wallet = h.engine.recharge(1, Decimal::new(3000, 2)).await.unwrap();
    assert_eq!(wallet.balance, Decimal::from(30));
    assert_eq!(h.notifier.count(EventType::WalletRecharged), 1);

    let order = h.engine.create_order(1, buy(2)).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(h.engine.wallet(1).await.unwrap().balance, Decimal::from(5));

    let snap = h.store.snapshot().await;
    assert_eq!(snap.ledger.len(), 2);
    assert!(snap.ledger.iter().all(|e| e.is_consistent()));
}
