//! Order Engine
//!
//! Create / pay / cancel / refund orders. Inventory, wallet and ledger are
//! only touched inside store transactions; the key-value store carries the
//! locks, the idempotency marks and the expiry queue.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::clock::Clock;
use crate::config::{ExpiryConfig, OrderConfig};
use crate::core_types::{OrderId, UserId};
use crate::error::{EngineError, EngineResult};
use crate::expiry::{ExpiryQueue, ExpiryTimers};
use crate::idempotency::IdempotencyGuard;
use crate::kv::KvStore;
use crate::lock::{self, LockHandle, LockManager, keys};
use crate::money;
use crate::notify::{EventType, Notification, Notifier};
use crate::store::{Store, StoreTx, rollback_quietly};

use super::model::{
    CreateOrderRequest, LedgerKind, ListQuery, NewOrder, Order, OrderView, Paged, PagedOrders,
    StatusHistoryEntry, Wallet,
};
use super::state_machine::{self, StateMachine, StateMachineConfig, TransitionOutcome};
use super::stats::StatsRecorder;
use super::status::{Operator, OrderStatus};
use super::wallet::{self, Credit, Debit, RetryPolicy};

const EXPIRY_REASON: &str = "payment timeout";

/// Result of an expiry cancellation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// Paid, already cancelled, ... nothing to do.
    NotPending(OrderStatus),
    NotFound,
}

/// Collaborators shared with the rest of the system.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub kv: Arc<dyn KvStore>,
    pub locks: Arc<LockManager>,
    pub notifier: Arc<dyn Notifier>,
    pub stats: Arc<dyn StatsRecorder>,
    pub clock: Arc<dyn Clock>,
}

pub struct OrderEngine {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    idempotency: IdempotencyGuard,
    state_machine: StateMachine,
    expiry: ExpiryQueue,
    timers: ExpiryTimers,
    notifier: Arc<dyn Notifier>,
    stats: Arc<dyn StatsRecorder>,
    clock: Arc<dyn Clock>,
    config: OrderConfig,
    expiry_config: ExpiryConfig,
    me: Weak<OrderEngine>,
}

impl OrderEngine {
    pub fn new(deps: EngineDeps, config: OrderConfig, expiry_config: ExpiryConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            let state_machine = StateMachine::new(
                Arc::clone(&deps.store),
                Arc::clone(&deps.locks),
                Arc::clone(&deps.notifier),
                Arc::clone(&deps.clock),
                StateMachineConfig {
                    lock_ttl: config.status_lock_ttl(),
                    lock_wait: config.cancel_lock_wait(),
                    conflict_retries: config.state_conflict_retries,
                    batch_budget: config.batch_budget(),
                },
            );
            Self {
                store: deps.store,
                locks: deps.locks,
                idempotency: IdempotencyGuard::new(
                    Arc::clone(&deps.kv),
                    config.idempotency_granularity,
                ),
                state_machine,
                expiry: ExpiryQueue::new(deps.kv),
                timers: ExpiryTimers::new(),
                notifier: deps.notifier,
                stats: deps.stats,
                clock: deps.clock,
                config,
                expiry_config,
                me: me.clone(),
            }
        })
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    pub fn expiry_queue(&self) -> &ExpiryQueue {
        &self.expiry
    }

    pub fn timers(&self) -> &ExpiryTimers {
        &self.timers
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.conditional_retries.max(1),
            backoff: self.config.retry_backoff(),
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Reserve stock, charge the wallet if it covers the total, persist the
    /// order. Returns the order as committed (`paid` or `pending`).
    pub async fn create_order(
        &self,
        user_id: UserId,
        req: CreateOrderRequest,
    ) -> EngineResult<Order> {
        req.validate()?;
        if user_id <= 0 {
            return Err(EngineError::InvalidArgument("user_id must be positive".into()));
        }

        let now = self.clock.now();
        let idem_key = self.idempotency.order_create_key(user_id, req.goods_id, now);
        match self.idempotency.check_only(&idem_key).await {
            Ok(true) => {
                debug!(user_id, goods_id = req.goods_id, "Duplicate order submission");
                return Err(EngineError::DuplicateSubmission);
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Idempotency check unavailable, continuing"),
        }

        let user_lock = self
            .acquire_create_lock(&keys::create_order_user(user_id))
            .await?;
        let goods_lock = match self.acquire_create_lock(&keys::goods_stock(req.goods_id)).await {
            Ok(h) => h,
            Err(e) => {
                release_opt(user_lock).await;
                return Err(e);
            }
        };

        let result = self.create_in_tx(user_id, &req, now).await;

        release_opt(goods_lock).await;
        release_opt(user_lock).await;

        let order = match result {
            Ok(order) => order,
            Err(e) => {
                debug!(user_id, goods_id = req.goods_id, error = %e, "Order creation failed");
                return Err(e);
            }
        };

        if let Err(e) = self
            .idempotency
            .set_mark(&idem_key, self.config.idempotency_ttl())
            .await
        {
            warn!(order_no = %order.order_no, error = %e, "Failed to set idempotency mark");
        }

        if order.status == OrderStatus::Pending {
            self.schedule_expiry(&order).await;
        }

        info!(
            order_no = %order.order_no,
            user_id,
            goods_id = order.goods_id,
            quantity = order.quantity,
            total = %order.total_amount,
            status = %order.status,
            "Order created"
        );
        self.notifier.notify(Notification::new(
            user_id,
            order.order_no.clone(),
            EventType::OrderCreated,
            serde_json::json!({
                "goods_id": order.goods_id,
                "quantity": order.quantity,
                "total_amount": money::format_amount(order.total_amount),
                "status": order.status,
            }),
        ));
        Ok(order)
    }

    /// `None` when the lock backend is down and degradation is allowed.
    async fn acquire_create_lock(&self, key: &str) -> EngineResult<Option<LockHandle>> {
        match self
            .locks
            .acquire_timeout(key, self.config.lock_ttl(), self.config.lock_wait(), true)
            .await
        {
            Ok(handle) => Ok(Some(handle)),
            Err(EngineError::LockBackendUnavailable(msg)) if self.config.degrade_without_locks => {
                warn!(key = %key, error = %msg, "Lock backend unavailable, relying on conditional updates");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_in_tx(
        &self,
        user_id: UserId,
        req: &CreateOrderRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<Order> {
        let mut tx = self.store.begin().await?;
        match self.create_steps(&mut *tx, user_id, req, now).await {
            Ok(order) => {
                tx.commit().await?;
                Ok(order)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn create_steps(
        &self,
        tx: &mut dyn StoreTx,
        user_id: UserId,
        req: &CreateOrderRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<Order> {
        let goods = tx
            .goods_for_update(req.goods_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("goods {}", req.goods_id)))?;
        if !goods.is_sellable() {
            return Err(EngineError::GoodsUnavailable(goods.id));
        }
        if goods.stock < req.quantity {
            return Err(EngineError::InsufficientStock {
                available: goods.stock,
                requested: req.quantity,
            });
        }

        let policy = self.retry_policy();
        wallet::decrement_stock(tx, goods.id, req.quantity, policy).await?;

        let total = money::line_total(goods.unit_price, req.quantity)?;
        let order_no = new_order_no();
        let ledger_id = wallet::try_debit(
            tx,
            Debit {
                user_id,
                amount: total,
                kind: LedgerKind::OrderPayment,
                description: "order payment",
                reference_no: &order_no,
            },
            now,
            policy,
        )
        .await?;
        let status = if ledger_id.is_some() {
            OrderStatus::Paid
        } else {
            OrderStatus::Pending
        };

        let order = tx
            .insert_order(NewOrder {
                order_no: order_no.clone(),
                user_id,
                goods_id: goods.id,
                merchant_id: goods.merchant_id,
                quantity: req.quantity,
                unit_price: goods.unit_price,
                total_amount: total,
                status,
                created_at: now,
            })
            .await?;

        if let Err(e) = self
            .stats
            .record(tx, goods.merchant_id, &order_no, total, now)
            .await
        {
            warn!(order_no = %order_no, merchant_id = goods.merchant_id, error = %e, "Merchant stats update failed");
        }

        Ok(order)
    }

    async fn schedule_expiry(&self, order: &Order) {
        let due = order.created_at
            + chrono::Duration::from_std(self.config.expiry_ttl()).unwrap_or(chrono::Duration::minutes(15));
        if let Err(e) = self.expiry.schedule(&order.order_no, due).await {
            warn!(order_no = %order.order_no, error = %e, "Expiry queue unavailable, database poller will catch it");
        }

        if !self.expiry_config.enable_timers {
            return;
        }
        let remaining = (due - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let delay = remaining + self.expiry_config.timer_grace();
        let me = self.me.clone();
        let order_no = order.order_no.clone();
        self.timers.arm(&order.order_no, delay, async move {
            let Some(engine) = me.upgrade() else {
                return;
            };
            match engine.cancel_expired_order(&order_no).await {
                Ok(CancelOutcome::Cancelled) => {
                    info!(order_no = %order_no, "Order expired by in-process timer")
                }
                Ok(_) => {}
                Err(e) => warn!(order_no = %order_no, error = %e, "In-process expiry failed"),
            }
        });
    }

    // ========================================================================
    // Pay
    // ========================================================================

    /// Payment callback for a pending order. Records an external payment;
    /// the wallet is not touched.
    pub async fn pay_order(&self, order_no: &str, amount: Decimal) -> EngineResult<TransitionOutcome> {
        money::validate_payment(amount)?;

        let pay_lock = self
            .locks
            .acquire_timeout(
                &keys::payment(order_no),
                self.config.lock_ttl(),
                self.config.cancel_lock_wait(),
                true,
            )
            .await?;
        let status_lock = match self.state_machine.lock_order(order_no).await {
            Ok(h) => h,
            Err(e) => {
                lock::release_quietly(pay_lock).await;
                return Err(e);
            }
        };

        let result = self.pay_in_tx(order_no, amount).await;

        lock::release_quietly(status_lock).await;
        lock::release_quietly(pay_lock).await;
        let outcome = result?;

        self.forget_expiry(order_no).await;
        info!(order_no = %order_no, amount = %amount, "Order paid");
        self.state_machine.notify_transition(&outcome, "payment received");
        Ok(outcome)
    }

    async fn pay_in_tx(&self, order_no: &str, amount: Decimal) -> EngineResult<TransitionOutcome> {
        let mut tx = self.store.begin_serializable().await?;
        let now = self.clock.now();
        match pay_steps(&mut *tx, order_no, amount, now).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Cancel / refund
    // ========================================================================

    /// User cancels their own pending order.
    pub async fn cancel_order(&self, user_id: UserId, order_no: &str) -> EngineResult<TransitionOutcome> {
        let order = self
            .store
            .get_order(order_no)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("order {order_no}")))?;
        if order.user_id != user_id {
            return Err(EngineError::Forbidden(format!("order {order_no}")));
        }
        self.update_status(order_no, OrderStatus::Cancelled, Operator::User, "cancelled by user")
            .await
    }

    /// Any matrix transition on behalf of `operator`, with expiry and
    /// idempotency cleanup after a cancellation.
    pub async fn update_status(
        &self,
        order_no: &str,
        to: OrderStatus,
        operator: Operator,
        reason: &str,
    ) -> EngineResult<TransitionOutcome> {
        let outcome = self
            .state_machine
            .update_status(order_no, to, operator, reason)
            .await?;
        if outcome.changed && outcome.from == OrderStatus::Pending {
            self.forget_expiry(order_no).await;
            if to == OrderStatus::Cancelled {
                self.clear_create_mark(&outcome.order).await;
            }
        }
        Ok(outcome)
    }

    /// Refund a paid order: stock back, total credited as `system_refund`.
    pub async fn refund_order(
        &self,
        order_no: &str,
        operator: Operator,
        reason: &str,
    ) -> EngineResult<TransitionOutcome> {
        self.update_status(order_no, OrderStatus::Refunded, operator, reason)
            .await
    }

    /// Cancel `order_no` if it is still pending. Safe to call any number of
    /// times from any expiry layer.
    pub async fn cancel_expired_order(&self, order_no: &str) -> EngineResult<CancelOutcome> {
        // Unlocked fast path for the common already-processed case.
        match self.store.get_order(order_no).await? {
            None => return Ok(CancelOutcome::NotFound),
            Some(o) if o.status != OrderStatus::Pending => {
                return Ok(CancelOutcome::NotPending(o.status));
            }
            Some(_) => {}
        }

        let cancel_lock = self
            .locks
            .acquire_timeout(
                &keys::cancel_order(order_no),
                self.config.lock_ttl(),
                self.config.cancel_lock_wait(),
                true,
            )
            .await?;
        let status_lock = match self.state_machine.lock_order(order_no).await {
            Ok(h) => h,
            Err(e) => {
                lock::release_quietly(cancel_lock).await;
                return Err(e);
            }
        };

        let result = self.cancel_expired_in_tx(order_no).await;

        lock::release_quietly(status_lock).await;
        lock::release_quietly(cancel_lock).await;

        let (outcome, order) = result?;
        if let Some(order) = order {
            self.forget_expiry(order_no).await;
            self.clear_create_mark(&order).await;
            info!(order_no = %order_no, user_id = order.user_id, "Expired order cancelled");
            self.notifier.notify(Notification::new(
                order.user_id,
                order_no,
                EventType::OrderExpired,
                serde_json::json!({
                    "from": OrderStatus::Pending,
                    "to": OrderStatus::Cancelled,
                    "reason": EXPIRY_REASON,
                }),
            ));
        }
        Ok(outcome)
    }

    async fn cancel_expired_in_tx(
        &self,
        order_no: &str,
    ) -> EngineResult<(CancelOutcome, Option<Order>)> {
        let mut tx = self.store.begin().await?;
        let now = self.clock.now();
        match expire_steps(&mut *tx, order_no, now).await {
            Ok(done) => {
                tx.commit().await?;
                Ok(done)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn forget_expiry(&self, order_no: &str) {
        self.timers.disarm(order_no);
        if let Err(e) = self.expiry.remove(order_no).await {
            debug!(order_no = %order_no, error = %e, "Expiry entry not removed");
        }
    }

    async fn clear_create_mark(&self, order: &Order) {
        let key = self
            .idempotency
            .order_create_key(order.user_id, order.goods_id, order.created_at);
        if let Err(e) = self.idempotency.clear_mark(&key).await {
            warn!(order_no = %order.order_no, error = %e, "Failed to clear idempotency mark");
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Owner-only view; other users' orders read as not found.
    pub async fn get_order(&self, user_id: UserId, order_id: OrderId) -> EngineResult<OrderView> {
        match self.store.get_order_by_id(order_id).await? {
            Some(order) if order.user_id == user_id => Ok(OrderView::from(&order)),
            _ => Err(EngineError::NotFound(format!("order {order_id}"))),
        }
    }

    pub async fn get_order_by_no(&self, user_id: UserId, order_no: &str) -> EngineResult<OrderView> {
        match self.store.get_order(order_no).await? {
            Some(order) if order.user_id == user_id => Ok(OrderView::from(&order)),
            _ => Err(EngineError::NotFound(format!("order {order_no}"))),
        }
    }

    pub async fn list_my_orders(
        &self,
        user_id: UserId,
        query: ListQuery<OrderStatus>,
    ) -> EngineResult<PagedOrders> {
        let (page, page_size) = query.normalized();
        let (rows, total) = self
            .store
            .list_orders(user_id, query.status, query.offset(), page_size)
            .await?;
        Ok(Paged {
            items: rows.iter().map(OrderView::from).collect(),
            total,
            page,
            page_size,
        })
    }

    pub async fn status_history(&self, order_no: &str) -> EngineResult<Vec<StatusHistoryEntry>> {
        self.store.status_history(order_no).await
    }

    // ========================================================================
    // Wallet
    // ========================================================================

    pub async fn recharge(&self, user_id: UserId, amount: Decimal) -> EngineResult<Wallet> {
        money::validate_payment(amount)?;
        let amount = money::to_storage(amount);
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let credited = wallet::credit(
            &mut *tx,
            Credit {
                user_id,
                amount,
                kind: LedgerKind::Recharge,
                description: "wallet recharge",
                reference_no: None,
                ref_entry_id: None,
            },
            now,
        )
        .await;
        let wallet = match credited {
            Ok(_) => match tx.wallet_for_update(user_id).await {
                Ok(Some(w)) => w,
                Ok(None) => {
                    rollback_quietly(tx).await;
                    return Err(EngineError::Internal(format!("wallet {user_id} missing after credit")));
                }
                Err(e) => {
                    rollback_quietly(tx).await;
                    return Err(e);
                }
            },
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        info!(user_id, amount = %amount, balance = %wallet.balance, "Wallet recharged");
        self.notifier.notify(Notification::new(
            user_id,
            "",
            EventType::WalletRecharged,
            serde_json::json!({
                "amount": money::format_amount(amount),
                "balance": money::format_amount(wallet.balance),
            }),
        ));
        Ok(wallet)
    }

    /// Zero-balance wallet if the user never had one.
    pub async fn wallet(&self, user_id: UserId) -> EngineResult<Wallet> {
        Ok(self.store.get_wallet(user_id).await?.unwrap_or(Wallet {
            user_id,
            balance: Decimal::ZERO,
            updated_at: self.clock.now(),
        }))
    }

    /// Stop all in-process timers (shutdown).
    pub fn shutdown(&self) {
        let armed = self.timers.len();
        self.timers.disarm_all();
        if armed > 0 {
            info!(armed, "In-process expiry timers stopped");
        }
    }
}

async fn release_opt(handle: Option<LockHandle>) {
    if let Some(h) = handle {
        lock::release_quietly(h).await;
    }
}

async fn pay_steps(
    tx: &mut dyn StoreTx,
    order_no: &str,
    amount: Decimal,
    now: DateTime<Utc>,
) -> EngineResult<TransitionOutcome> {
    let order = tx
        .order_for_update(order_no)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("order {order_no}")))?;
    if order.status != OrderStatus::Pending {
        return Err(EngineError::InvalidState(format!(
            "order {order_no} is {}",
            order.status
        )));
    }
    if money::to_storage(amount) != order.total_amount {
        return Err(EngineError::AmountMismatch {
            expected: order.total_amount,
            actual: amount,
        });
    }
    state_machine::apply_in_tx(
        tx,
        order_no,
        OrderStatus::Paid,
        Operator::System,
        "payment received",
        now,
    )
    .await
}

/// Conditional pending -> cancelled. Loses quietly to a concurrent payment.
async fn expire_steps(
    tx: &mut dyn StoreTx,
    order_no: &str,
    now: DateTime<Utc>,
) -> EngineResult<(CancelOutcome, Option<Order>)> {
    let Some(order) = tx.order_for_update(order_no).await? else {
        return Ok((CancelOutcome::NotFound, None));
    };
    if order.status != OrderStatus::Pending {
        return Ok((CancelOutcome::NotPending(order.status), None));
    }
    if !tx
        .set_order_status_if(order_no, OrderStatus::Pending, OrderStatus::Cancelled, now)
        .await?
    {
        return Ok((CancelOutcome::NotPending(order.status), None));
    }
    tx.insert_history(StatusHistoryEntry {
        order_no: order_no.to_string(),
        from_status: OrderStatus::Pending,
        to_status: OrderStatus::Cancelled,
        operator: Operator::System,
        reason: EXPIRY_REASON.to_string(),
        created_at: now,
    })
    .await?;
    tx.restore_stock(order.goods_id, order.quantity).await?;
    Ok((CancelOutcome::Cancelled, Some(order)))
}

/// `ORD` + ULID: time-prefixed, random suffix.
pub fn new_order_no() -> String {
    format!("ORD{}", ulid::Ulid::new())
}

/// Log-and-continue helper for background callers.
pub fn log_cancel_result(order_no: &str, source: &'static str, result: &EngineResult<CancelOutcome>) {
    match result {
        Ok(CancelOutcome::Cancelled) => info!(order_no = %order_no, source, "Order expired"),
        Ok(other) => debug!(order_no = %order_no, source, outcome = ?other, "Expiry no-op"),
        Err(e) if e.is_retryable() => warn!(order_no = %order_no, source, error = %e, "Expiry deferred"),
        Err(e) => error!(order_no = %order_no, source, error = %e, "Expiry failed"),
    }
}
