//! In-memory relational store.
//!
//! One `tokio::sync::Mutex` guards all tables. A transaction takes the guard,
//! works on a private copy, and writes it back on commit, so a rollback (or a
//! dropped transaction) leaves nothing behind. Transactions are therefore
//! fully serialized, which satisfies every isolation level callers ask for.
//!
//! Do not call `Store` read methods while holding a `MemoryTx` in the same
//! task: they wait for the same mutex.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::booking::model::{Booking, BookingStatus, NewBooking, Room, RoomStatus, UsageLog};
use crate::core_types::{BookingId, GoodsId, LedgerId, MerchantId, OrderId, RoomId, UserId};
use crate::error::{EngineError, EngineResult};
use crate::order::model::{
    Goods, GoodsStatus, LedgerEntry, LedgerKind, NewLedgerEntry, NewOrder, Order,
    StatusHistoryEntry, Wallet,
};
use crate::order::status::OrderStatus;

use super::{Store, StoreTx};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MerchantStat {
    pub order_count: i64,
    pub total_amount: Decimal,
    pub last_order_no: String,
}

/// Table contents. Public so tests can assert on committed state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    pub goods: BTreeMap<GoodsId, Goods>,
    pub wallets: BTreeMap<UserId, Wallet>,
    pub ledger: Vec<LedgerEntry>,
    pub orders: Vec<Order>,
    pub history: Vec<StatusHistoryEntry>,
    pub merchant_stats: HashMap<MerchantId, MerchantStat>,
    pub rooms: BTreeMap<RoomId, Room>,
    pub bookings: Vec<Booking>,
    pub usage_logs: Vec<UsageLog>,
}

impl MemoryTables {
    pub fn order(&self, order_no: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.order_no == order_no)
    }

    fn order_mut(&mut self, order_no: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.order_no == order_no)
    }

    fn booking(&self, booking_no: &str) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.booking_no == booking_no)
    }

    fn overlapping(&self, room_id: RoomId, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Booking> {
        self.bookings
            .iter()
            .filter(|b| b.room_id == room_id && b.status.blocks_slot() && b.overlaps(start, end))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
    failpoints: Arc<StdMutex<HashSet<&'static str>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named transaction operation fail with `Internal` until
    /// cleared. Names match the `StoreTx` method names.
    pub fn fail_on(&self, op: &'static str) {
        self.failpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op);
    }

    pub fn clear_failpoints(&self) {
        self.failpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Simulate an outage: `begin` and `ping` fail with `DatabaseUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Copy of the committed tables.
    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }

    pub async fn seed_goods(&self, goods: Goods) {
        self.tables.lock().await.goods.insert(goods.id, goods);
    }

    pub async fn seed_wallet(&self, user_id: UserId, balance: Decimal) {
        self.tables.lock().await.wallets.insert(
            user_id,
            Wallet {
                user_id,
                balance,
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn seed_room(&self, room: Room) {
        self.tables.lock().await.rooms.insert(room.id, room);
    }

    pub async fn seed_booking(&self, booking: Booking) {
        self.tables.lock().await.bookings.push(booking);
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(EngineError::DatabaseUnavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }

    async fn open(&self) -> EngineResult<Box<dyn StoreTx>> {
        self.check_available()?;
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            failpoints: Arc::clone(&self.failpoints),
        }))
    }
}

fn page<T: Clone>(mut rows: Vec<T>, offset: u64, limit: u32) -> (Vec<T>, u64) {
    let total = rows.len() as u64;
    let start = (offset as usize).min(rows.len());
    let items = rows.drain(start..).take(limit as usize).collect();
    (items, total)
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> EngineResult<Box<dyn StoreTx>> {
        self.open().await
    }

    async fn begin_serializable(&self) -> EngineResult<Box<dyn StoreTx>> {
        self.open().await
    }

    async fn ping(&self) -> EngineResult<()> {
        self.check_available()
    }

    async fn get_order(&self, order_no: &str) -> EngineResult<Option<Order>> {
        Ok(self.tables.lock().await.order(order_no).cloned())
    }

    async fn get_order_by_id(&self, id: OrderId) -> EngineResult<Option<Order>> {
        let t = self.tables.lock().await;
        Ok(t.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn list_orders(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
        offset: u64,
        limit: u32,
    ) -> EngineResult<(Vec<Order>, u64)> {
        let t = self.tables.lock().await;
        let mut rows: Vec<Order> = t
            .orders
            .iter()
            .filter(|o| o.user_id == user_id && status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(rows, offset, limit))
    }

    async fn status_history(&self, order_no: &str) -> EngineResult<Vec<StatusHistoryEntry>> {
        let t = self.tables.lock().await;
        Ok(t.history
            .iter()
            .filter(|h| h.order_no == order_no)
            .cloned()
            .collect())
    }

    async fn expired_pending_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> EngineResult<Vec<String>> {
        let t = self.tables.lock().await;
        let mut rows: Vec<&Order> = t
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::Pending && o.created_at < created_before)
            .collect();
        rows.sort_by_key(|o| o.created_at);
        Ok(rows
            .into_iter()
            .take(limit as usize)
            .map(|o| o.order_no.clone())
            .collect())
    }

    async fn get_goods(&self, id: GoodsId) -> EngineResult<Option<Goods>> {
        Ok(self.tables.lock().await.goods.get(&id).cloned())
    }

    async fn get_wallet(&self, user_id: UserId) -> EngineResult<Option<Wallet>> {
        Ok(self.tables.lock().await.wallets.get(&user_id).cloned())
    }

    async fn ledger_entries(&self, user_id: UserId) -> EngineResult<Vec<LedgerEntry>> {
        let t = self.tables.lock().await;
        Ok(t.ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn orphaned_payments(
        &self,
        since: DateTime<Utc>,
        window: Duration,
    ) -> EngineResult<Vec<LedgerEntry>> {
        let t = self.tables.lock().await;
        let compensated: HashSet<LedgerId> = t
            .ledger
            .iter()
            .filter(|e| e.kind == LedgerKind::SystemRefund)
            .filter_map(|e| e.ref_entry_id)
            .collect();
        Ok(t.ledger
            .iter()
            .filter(|e| e.kind == LedgerKind::OrderPayment && e.created_at >= since)
            .filter(|e| !compensated.contains(&e.id))
            .filter(|e| {
                !t.orders.iter().any(|o| {
                    o.user_id == e.user_id
                        && o.total_amount == e.amount
                        && o.created_at >= e.created_at - window
                        && o.created_at <= e.created_at + window
                })
            })
            .cloned()
            .collect())
    }

    async fn paid_orders_without_ledger(&self, since: DateTime<Utc>) -> EngineResult<Vec<Order>> {
        let t = self.tables.lock().await;
        Ok(t.orders
            .iter()
            .filter(|o| o.status == OrderStatus::Paid && o.created_at >= since)
            .filter(|o| {
                !t.ledger.iter().any(|e| {
                    e.kind == LedgerKind::OrderPayment
                        && e.reference_no.as_deref() == Some(o.order_no.as_str())
                })
            })
            .filter(|o| {
                !t.history.iter().any(|h| {
                    h.order_no == o.order_no
                        && h.from_status == OrderStatus::Pending
                        && h.to_status == OrderStatus::Paid
                })
            })
            .cloned()
            .collect())
    }

    async fn negative_stock_goods(&self) -> EngineResult<Vec<Goods>> {
        let t = self.tables.lock().await;
        Ok(t.goods.values().filter(|g| g.stock < 0).cloned().collect())
    }

    async fn get_room(&self, id: RoomId) -> EngineResult<Option<Room>> {
        Ok(self.tables.lock().await.rooms.get(&id).cloned())
    }

    async fn get_booking(&self, booking_no: &str) -> EngineResult<Option<Booking>> {
        Ok(self.tables.lock().await.booking(booking_no).cloned())
    }

    async fn list_bookings(
        &self,
        user_id: UserId,
        status: Option<BookingStatus>,
        offset: u64,
        limit: u32,
    ) -> EngineResult<(Vec<Booking>, u64)> {
        let t = self.tables.lock().await;
        let mut rows: Vec<Booking> = t
            .bookings
            .iter()
            .filter(|b| b.user_id == user_id && status.is_none_or(|s| b.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(rows, offset, limit))
    }

    async fn overlapping_bookings(
        &self,
        room_id: RoomId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Booking>> {
        Ok(self.tables.lock().await.overlapping(room_id, start, end))
    }

    async fn bookings_due_for_start(&self, now: DateTime<Utc>, limit: u32) -> EngineResult<Vec<String>> {
        let t = self.tables.lock().await;
        Ok(t.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Paid && b.start_time <= now)
            .take(limit as usize)
            .map(|b| b.booking_no.clone())
            .collect())
    }

    async fn bookings_due_for_end(&self, now: DateTime<Utc>, limit: u32) -> EngineResult<Vec<String>> {
        let t = self.tables.lock().await;
        Ok(t.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::InUse && b.end_time <= now)
            .take(limit as usize)
            .map(|b| b.booking_no.clone())
            .collect())
    }

    async fn stale_pending_bookings(
        &self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> EngineResult<Vec<String>> {
        let t = self.tables.lock().await;
        Ok(t.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Pending && b.created_at <= created_before)
            .take(limit as usize)
            .map(|b| b.booking_no.clone())
            .collect())
    }

    async fn usage_log(&self, booking_id: BookingId) -> EngineResult<Option<UsageLog>> {
        let t = self.tables.lock().await;
        Ok(t.usage_logs
            .iter()
            .find(|l| l.booking_id == booking_id)
            .cloned())
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryTables>,
    work: MemoryTables,
    failpoints: Arc<StdMutex<HashSet<&'static str>>>,
}

impl MemoryTx {
    fn failpoint(&self, op: &'static str) -> EngineResult<()> {
        let armed = self
            .failpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(op);
        if armed {
            Err(EngineError::Internal(format!("injected failure in {op}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn goods_for_update(&mut self, id: GoodsId) -> EngineResult<Option<Goods>> {
        self.failpoint("goods_for_update")?;
        Ok(self.work.goods.get(&id).cloned())
    }

    async fn decrement_stock(&mut self, id: GoodsId, qty: i32) -> EngineResult<bool> {
        self.failpoint("decrement_stock")?;
        match self.work.goods.get_mut(&id) {
            Some(g) if g.stock >= qty && g.status == GoodsStatus::Active => {
                g.stock -= qty;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore_stock(&mut self, id: GoodsId, qty: i32) -> EngineResult<()> {
        self.failpoint("restore_stock")?;
        if let Some(g) = self.work.goods.get_mut(&id) {
            g.stock += qty;
        }
        Ok(())
    }

    async fn clamp_negative_stock(&mut self, id: GoodsId) -> EngineResult<bool> {
        match self.work.goods.get_mut(&id) {
            Some(g) if g.stock < 0 => {
                g.stock = 0;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn wallet_for_update(&mut self, user_id: UserId) -> EngineResult<Option<Wallet>> {
        Ok(self.work.wallets.get(&user_id).cloned())
    }

    async fn ensure_wallet(&mut self, user_id: UserId, at: DateTime<Utc>) -> EngineResult<Wallet> {
        self.failpoint("ensure_wallet")?;
        Ok(self
            .work
            .wallets
            .entry(user_id)
            .or_insert_with(|| Wallet {
                user_id,
                balance: Decimal::ZERO,
                updated_at: at,
            })
            .clone())
    }

    async fn debit_wallet(
        &mut self,
        user_id: UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        self.failpoint("debit_wallet")?;
        match self.work.wallets.get_mut(&user_id) {
            Some(w) if w.balance >= amount => {
                w.balance -= amount;
                w.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn credit_wallet(
        &mut self,
        user_id: UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.failpoint("credit_wallet")?;
        let w = self.work.wallets.entry(user_id).or_insert_with(|| Wallet {
            user_id,
            balance: Decimal::ZERO,
            updated_at: at,
        });
        w.balance += amount;
        w.updated_at = at;
        Ok(())
    }

    async fn insert_ledger(&mut self, entry: NewLedgerEntry) -> EngineResult<LedgerId> {
        self.failpoint("insert_ledger")?;
        let id = self.work.ledger.len() as LedgerId + 1;
        self.work.ledger.push(LedgerEntry {
            id,
            user_id: entry.user_id,
            kind: entry.kind,
            amount: entry.amount,
            balance_before: entry.balance_before,
            balance_after: entry.balance_after,
            description: entry.description,
            reference_no: entry.reference_no,
            ref_entry_id: entry.ref_entry_id,
            created_at: entry.created_at,
        });
        Ok(id)
    }

    async fn refund_exists(&mut self, entry_id: LedgerId) -> EngineResult<bool> {
        Ok(self
            .work
            .ledger
            .iter()
            .any(|e| e.kind == LedgerKind::SystemRefund && e.ref_entry_id == Some(entry_id)))
    }

    async fn insert_order(&mut self, order: NewOrder) -> EngineResult<Order> {
        self.failpoint("insert_order")?;
        if self.work.order(&order.order_no).is_some() {
            return Err(EngineError::Internal(format!(
                "duplicate order_no {}",
                order.order_no
            )));
        }
        let row = Order {
            id: self.work.orders.len() as OrderId + 1,
            order_no: order.order_no,
            user_id: order.user_id,
            goods_id: order.goods_id,
            merchant_id: order.merchant_id,
            quantity: order.quantity,
            unit_price: order.unit_price,
            total_amount: order.total_amount,
            status: order.status,
            created_at: order.created_at,
            updated_at: order.created_at,
        };
        self.work.orders.push(row.clone());
        Ok(row)
    }

    async fn order_for_update(&mut self, order_no: &str) -> EngineResult<Option<Order>> {
        Ok(self.work.order(order_no).cloned())
    }

    async fn set_order_status(
        &mut self,
        order_no: &str,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.failpoint("set_order_status")?;
        let order = self
            .work
            .order_mut(order_no)
            .ok_or_else(|| EngineError::NotFound(format!("order {order_no}")))?;
        order.status = to;
        order.updated_at = at;
        Ok(())
    }

    async fn set_order_status_if(
        &mut self,
        order_no: &str,
        expected: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        self.failpoint("set_order_status")?;
        match self.work.order_mut(order_no) {
            Some(o) if o.status == expected => {
                o.status = to;
                o.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_history(&mut self, entry: StatusHistoryEntry) -> EngineResult<()> {
        self.failpoint("insert_history")?;
        self.work.history.push(entry);
        Ok(())
    }

    async fn record_merchant_stats(
        &mut self,
        merchant_id: MerchantId,
        order_no: &str,
        amount: Decimal,
        _at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.failpoint("record_merchant_stats")?;
        let stat = self.work.merchant_stats.entry(merchant_id).or_default();
        stat.order_count += 1;
        stat.total_amount += amount;
        stat.last_order_no = order_no.to_string();
        Ok(())
    }

    async fn room_for_update(&mut self, id: RoomId) -> EngineResult<Option<Room>> {
        Ok(self.work.rooms.get(&id).cloned())
    }

    async fn set_room_status(
        &mut self,
        id: RoomId,
        status: RoomStatus,
        _at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.failpoint("set_room_status")?;
        let room = self
            .work
            .rooms
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("room {id}")))?;
        room.status = status;
        Ok(())
    }

    async fn booking_for_update(&mut self, booking_no: &str) -> EngineResult<Option<Booking>> {
        Ok(self.work.booking(booking_no).cloned())
    }

    async fn overlapping_bookings(
        &mut self,
        room_id: RoomId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Booking>> {
        Ok(self.work.overlapping(room_id, start, end))
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> EngineResult<Booking> {
        self.failpoint("insert_booking")?;
        let row = Booking {
            id: self.work.bookings.len() as BookingId + 1,
            booking_no: booking.booking_no,
            room_id: booking.room_id,
            user_id: booking.user_id,
            start_time: booking.start_time,
            end_time: booking.end_time,
            hours: booking.hours,
            total_amount: booking.total_amount,
            paid_amount: Decimal::ZERO,
            status: BookingStatus::Pending,
            remarks: booking.remarks,
            created_at: booking.created_at,
            updated_at: booking.created_at,
        };
        self.work.bookings.push(row.clone());
        Ok(row)
    }

    async fn update_booking(&mut self, booking: &Booking) -> EngineResult<()> {
        self.failpoint("update_booking")?;
        let row = self
            .work
            .bookings
            .iter_mut()
            .find(|b| b.booking_no == booking.booking_no)
            .ok_or_else(|| EngineError::NotFound(format!("booking {}", booking.booking_no)))?;
        row.status = booking.status;
        row.paid_amount = booking.paid_amount;
        row.remarks = booking.remarks.clone();
        row.updated_at = booking.updated_at;
        Ok(())
    }

    async fn count_in_use_bookings(
        &mut self,
        room_id: RoomId,
        exclude: BookingId,
    ) -> EngineResult<i64> {
        Ok(self
            .work
            .bookings
            .iter()
            .filter(|b| b.room_id == room_id && b.id != exclude && b.status == BookingStatus::InUse)
            .count() as i64)
    }

    async fn insert_usage_log(
        &mut self,
        booking: &Booking,
        check_in_at: DateTime<Utc>,
    ) -> EngineResult<UsageLog> {
        self.failpoint("insert_usage_log")?;
        let log = UsageLog {
            id: self.work.usage_logs.len() as i64 + 1,
            booking_id: booking.id,
            room_id: booking.room_id,
            user_id: booking.user_id,
            check_in_at,
            check_out_at: None,
            actual_hours: Decimal::ZERO,
        };
        self.work.usage_logs.push(log.clone());
        Ok(log)
    }

    async fn usage_log_for_update(
        &mut self,
        booking_id: BookingId,
    ) -> EngineResult<Option<UsageLog>> {
        Ok(self
            .work
            .usage_logs
            .iter()
            .find(|l| l.booking_id == booking_id)
            .cloned())
    }

    async fn close_usage_log(
        &mut self,
        id: i64,
        check_out_at: DateTime<Utc>,
        actual_hours: Decimal,
    ) -> EngineResult<()> {
        let log = self
            .work
            .usage_logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("usage log {id}")))?;
        log.check_out_at = Some(check_out_at);
        log.actual_hours = actual_hours;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        self.failpoint("commit")?;
        let MemoryTx {
            mut guard, work, ..
        } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        Ok(())
    }
}
