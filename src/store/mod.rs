//! Relational store port
//!
//! `Store` serves unlocked reads and opens transactions; every mutation goes
//! through a `StoreTx`. Row locks (`*_for_update`) are held until the
//! transaction commits or rolls back.
//!
//! Conditional updates (`decrement_stock`, `debit_wallet`,
//! `set_order_status_if`) return `false` when their predicate no longer holds,
//! which is how callers detect a concurrent change.

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::booking::model::{Booking, BookingStatus, NewBooking, Room, RoomStatus, UsageLog};
use crate::core_types::{BookingId, GoodsId, LedgerId, MerchantId, OrderId, RoomId, UserId};
use crate::error::EngineResult;
use crate::order::model::{
    Goods, LedgerEntry, NewLedgerEntry, NewOrder, Order, StatusHistoryEntry, Wallet,
};
use crate::order::status::OrderStatus;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn begin(&self) -> EngineResult<Box<dyn StoreTx>>;

    async fn begin_serializable(&self) -> EngineResult<Box<dyn StoreTx>>;

    async fn ping(&self) -> EngineResult<()>;

    // === Orders ===

    async fn get_order(&self, order_no: &str) -> EngineResult<Option<Order>>;

    async fn get_order_by_id(&self, id: OrderId) -> EngineResult<Option<Order>>;

    /// Newest first. Returns the page and the total match count.
    async fn list_orders(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
        offset: u64,
        limit: u32,
    ) -> EngineResult<(Vec<Order>, u64)>;

    /// Oldest first.
    async fn status_history(&self, order_no: &str) -> EngineResult<Vec<StatusHistoryEntry>>;

    /// `status = pending AND created_at < created_before`, oldest first.
    async fn expired_pending_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> EngineResult<Vec<String>>;

    // === Catalog and wallets ===

    async fn get_goods(&self, id: GoodsId) -> EngineResult<Option<Goods>>;

    async fn get_wallet(&self, user_id: UserId) -> EngineResult<Option<Wallet>>;

    /// Oldest first.
    async fn ledger_entries(&self, user_id: UserId) -> EngineResult<Vec<LedgerEntry>>;

    // === Compensation ===

    /// `order_payment` entries created at or after `since` with no order of
    /// the same user and amount created within `window` of the entry, and
    /// not yet compensated by a `system_refund`.
    async fn orphaned_payments(
        &self,
        since: DateTime<Utc>,
        window: Duration,
    ) -> EngineResult<Vec<LedgerEntry>>;

    /// Paid orders created at or after `since` with no `order_payment` entry
    /// referencing them.
    async fn paid_orders_without_ledger(&self, since: DateTime<Utc>) -> EngineResult<Vec<Order>>;

    async fn negative_stock_goods(&self) -> EngineResult<Vec<Goods>>;

    // === Rooms and bookings ===

    async fn get_room(&self, id: RoomId) -> EngineResult<Option<Room>>;

    async fn get_booking(&self, booking_no: &str) -> EngineResult<Option<Booking>>;

    async fn list_bookings(
        &self,
        user_id: UserId,
        status: Option<BookingStatus>,
        offset: u64,
        limit: u32,
    ) -> EngineResult<(Vec<Booking>, u64)>;

    /// Paid/in-use bookings of `room_id` intersecting `[start, end)`.
    async fn overlapping_bookings(
        &self,
        room_id: RoomId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Booking>>;

    /// `status = paid AND start_time <= now`
    async fn bookings_due_for_start(&self, now: DateTime<Utc>, limit: u32) -> EngineResult<Vec<String>>;

    /// `status = in_use AND end_time <= now`
    async fn bookings_due_for_end(&self, now: DateTime<Utc>, limit: u32) -> EngineResult<Vec<String>>;

    /// `status = pending AND created_at <= created_before`
    async fn stale_pending_bookings(
        &self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> EngineResult<Vec<String>>;

    async fn usage_log(&self, booking_id: BookingId) -> EngineResult<Option<UsageLog>>;
}

#[async_trait]
pub trait StoreTx: Send {
    // === Goods ===

    async fn goods_for_update(&mut self, id: GoodsId) -> EngineResult<Option<Goods>>;

    /// `stock = stock - qty WHERE stock >= qty AND status = active`
    async fn decrement_stock(&mut self, id: GoodsId, qty: i32) -> EngineResult<bool>;

    /// `stock = stock + qty`
    async fn restore_stock(&mut self, id: GoodsId, qty: i32) -> EngineResult<()>;

    /// `stock = 0 WHERE stock < 0`
    async fn clamp_negative_stock(&mut self, id: GoodsId) -> EngineResult<bool>;

    // === Wallets ===

    async fn wallet_for_update(&mut self, user_id: UserId) -> EngineResult<Option<Wallet>>;

    /// Create with zero balance if absent; returns the locked row.
    async fn ensure_wallet(&mut self, user_id: UserId, at: DateTime<Utc>) -> EngineResult<Wallet>;

    /// `balance = balance - amount WHERE balance >= amount`
    async fn debit_wallet(
        &mut self,
        user_id: UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    async fn credit_wallet(
        &mut self,
        user_id: UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;

    async fn insert_ledger(&mut self, entry: NewLedgerEntry) -> EngineResult<LedgerId>;

    /// A `system_refund` entry already compensates ledger entry `entry_id`.
    async fn refund_exists(&mut self, entry_id: LedgerId) -> EngineResult<bool>;

    // === Orders ===

    async fn insert_order(&mut self, order: NewOrder) -> EngineResult<Order>;

    async fn order_for_update(&mut self, order_no: &str) -> EngineResult<Option<Order>>;

    async fn set_order_status(
        &mut self,
        order_no: &str,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;

    /// `status = to WHERE order_no = ? AND status = expected`
    async fn set_order_status_if(
        &mut self,
        order_no: &str,
        expected: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    async fn insert_history(&mut self, entry: StatusHistoryEntry) -> EngineResult<()>;

    /// Per-merchant order counters. A failure here must leave the
    /// transaction usable.
    async fn record_merchant_stats(
        &mut self,
        merchant_id: MerchantId,
        order_no: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;

    // === Rooms and bookings ===

    async fn room_for_update(&mut self, id: RoomId) -> EngineResult<Option<Room>>;

    async fn set_room_status(
        &mut self,
        id: RoomId,
        status: RoomStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;

    async fn booking_for_update(&mut self, booking_no: &str) -> EngineResult<Option<Booking>>;

    async fn overlapping_bookings(
        &mut self,
        room_id: RoomId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Booking>>;

    async fn insert_booking(&mut self, booking: NewBooking) -> EngineResult<Booking>;

    /// Persist status, paid amount, remarks and `updated_at`.
    async fn update_booking(&mut self, booking: &Booking) -> EngineResult<()>;

    /// In-use bookings of `room_id` other than `exclude`.
    async fn count_in_use_bookings(
        &mut self,
        room_id: RoomId,
        exclude: BookingId,
    ) -> EngineResult<i64>;

    async fn insert_usage_log(
        &mut self,
        booking: &Booking,
        check_in_at: DateTime<Utc>,
    ) -> EngineResult<UsageLog>;

    async fn usage_log_for_update(&mut self, booking_id: BookingId)
    -> EngineResult<Option<UsageLog>>;

    async fn close_usage_log(
        &mut self,
        id: i64,
        check_out_at: DateTime<Utc>,
        actual_hours: Decimal,
    ) -> EngineResult<()>;

    async fn commit(self: Box<Self>) -> EngineResult<()>;

    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}

/// Roll back, logging instead of masking the error that caused it.
pub async fn rollback_quietly(tx: Box<dyn StoreTx>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Rollback failed");
    }
}
