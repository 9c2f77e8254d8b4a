//! PostgreSQL store
//!
//! Row locks via `SELECT ... FOR UPDATE`; every stock/balance/status mutation
//! is a conditional `UPDATE` whose WHERE clause re-asserts its precondition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, warn};

use crate::booking::model::{Booking, BookingStatus, NewBooking, Room, RoomStatus, UsageLog};
use crate::core_types::{BookingId, GoodsId, LedgerId, MerchantId, OrderId, RoomId, UserId};
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::order::model::{
    Goods, GoodsStatus, LedgerEntry, LedgerKind, NewLedgerEntry, NewOrder, Order,
    StatusHistoryEntry, Wallet,
};
use crate::order::status::{Operator, OrderStatus};

use super::schema;
use super::{Store, StoreTx};

const ORDER_COLUMNS: &str = "id, order_no, user_id, goods_id, merchant_id, quantity, unit_price, \
     total_amount, status, created_at, updated_at";
const GOODS_COLUMNS: &str = "id, merchant_id, name, unit_price, stock, status, deleted";
const LEDGER_COLUMNS: &str = "id, user_id, kind, amount, balance_before, balance_after, \
     description, reference_no, ref_entry_id, created_at";
const BOOKING_COLUMNS: &str = "id, booking_no, room_id, user_id, start_time, end_time, hours, \
     total_amount, paid_amount, status, remarks, created_at, updated_at";
const USAGE_COLUMNS: &str =
    "id, booking_id, room_id, user_id, check_in_at, check_out_at, actual_hours";

fn corrupt(what: &str, value: impl std::fmt::Display) -> EngineError {
    EngineError::Internal(format!("unexpected {what} in database: {value}"))
}

fn order_from_row(row: &PgRow) -> EngineResult<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        order_no: row.try_get("order_no")?,
        user_id: row.try_get("user_id")?,
        goods_id: row.try_get("goods_id")?,
        merchant_id: row.try_get("merchant_id")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        total_amount: row.try_get("total_amount")?,
        status: OrderStatus::parse(&status).ok_or_else(|| corrupt("order status", &status))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn goods_from_row(row: &PgRow) -> EngineResult<Goods> {
    let status: String = row.try_get("status")?;
    Ok(Goods {
        id: row.try_get("id")?,
        merchant_id: row.try_get("merchant_id")?,
        name: row.try_get("name")?,
        unit_price: row.try_get("unit_price")?,
        stock: row.try_get("stock")?,
        status: GoodsStatus::parse(&status).ok_or_else(|| corrupt("goods status", &status))?,
        deleted: row.try_get("deleted")?,
    })
}

fn wallet_from_row(row: &PgRow) -> EngineResult<Wallet> {
    Ok(Wallet {
        user_id: row.try_get("user_id")?,
        balance: row.try_get("balance")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ledger_from_row(row: &PgRow) -> EngineResult<LedgerEntry> {
    let kind: String = row.try_get("kind")?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: LedgerKind::parse(&kind).ok_or_else(|| corrupt("ledger kind", &kind))?,
        amount: row.try_get("amount")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        description: row.try_get("description")?,
        reference_no: row.try_get("reference_no")?,
        ref_entry_id: row.try_get("ref_entry_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn history_from_row(row: &PgRow) -> EngineResult<StatusHistoryEntry> {
    let from: String = row.try_get("from_status")?;
    let to: String = row.try_get("to_status")?;
    let operator: String = row.try_get("operator")?;
    Ok(StatusHistoryEntry {
        order_no: row.try_get("order_no")?,
        from_status: OrderStatus::parse(&from).ok_or_else(|| corrupt("order status", &from))?,
        to_status: OrderStatus::parse(&to).ok_or_else(|| corrupt("order status", &to))?,
        operator: Operator::parse(&operator).ok_or_else(|| corrupt("operator", &operator))?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn room_from_row(row: &PgRow) -> EngineResult<Room> {
    let status: i16 = row.try_get("status")?;
    Ok(Room {
        id: row.try_get("id")?,
        room_number: row.try_get("room_number")?,
        name: row.try_get("name")?,
        hourly_rate: row.try_get("hourly_rate")?,
        status: RoomStatus::from_id(status).ok_or_else(|| corrupt("room status", status))?,
    })
}

fn booking_from_row(row: &PgRow) -> EngineResult<Booking> {
    let status: i16 = row.try_get("status")?;
    Ok(Booking {
        id: row.try_get("id")?,
        booking_no: row.try_get("booking_no")?,
        room_id: row.try_get("room_id")?,
        user_id: row.try_get("user_id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        hours: row.try_get("hours")?,
        total_amount: row.try_get("total_amount")?,
        paid_amount: row.try_get("paid_amount")?,
        status: BookingStatus::from_id(status).ok_or_else(|| corrupt("booking status", status))?,
        remarks: row.try_get("remarks")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn usage_from_row(row: &PgRow) -> EngineResult<UsageLog> {
    Ok(UsageLog {
        id: row.try_get("id")?,
        booking_id: row.try_get("booking_id")?,
        room_id: row.try_get("room_id")?,
        user_id: row.try_get("user_id")?,
        check_in_at: row.try_get("check_in_at")?,
        check_out_at: row.try_get("check_out_at")?,
        actual_hours: row.try_get("actual_hours")?,
    })
}

fn collect<T>(rows: &[PgRow], f: fn(&PgRow) -> EngineResult<T>) -> EngineResult<Vec<T>> {
    rows.iter().map(f).collect()
}

pub struct PgStore {
    db: Arc<Database>,
}

impl PgStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Apply the schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> EngineResult<()> {
        for stmt in schema::STATEMENTS {
            sqlx::query(stmt).execute(self.db.pool()).await?;
        }
        info!(statements = schema::STATEMENTS.len(), "Schema applied");
        Ok(())
    }

    async fn open(&self, serializable: bool) -> EngineResult<Box<dyn StoreTx>> {
        let mut tx = self.db.begin().await?;
        if serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;
        }
        Ok(Box::new(PgTx { tx }))
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> EngineResult<Box<dyn StoreTx>> {
        self.open(false).await
    }

    async fn begin_serializable(&self) -> EngineResult<Box<dyn StoreTx>> {
        self.open(true).await
    }

    async fn ping(&self) -> EngineResult<()> {
        self.db.health_check().await?;
        Ok(())
    }

    async fn get_order(&self, order_no: &str) -> EngineResult<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1"))
            .bind(order_no)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn get_order_by_id(&self, id: OrderId) -> EngineResult<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn list_orders(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
        offset: u64,
        limit: u32,
    ) -> EngineResult<(Vec<Order>, u64)> {
        let status = status.map(|s| s.as_str());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)",
        )
        .bind(user_id)
        .bind(status)
        .fetch_one(self.db.pool())
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(user_id)
        .bind(status)
        .bind(i64::from(limit))
        .bind(offset as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok((collect(&rows, order_from_row)?, total as u64))
    }

    async fn status_history(&self, order_no: &str) -> EngineResult<Vec<StatusHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT order_no, from_status, to_status, operator, reason, created_at \
             FROM order_status_history WHERE order_no = $1 ORDER BY id",
        )
        .bind(order_no)
        .fetch_all(self.db.pool())
        .await?;
        collect(&rows, history_from_row)
    }

    async fn expired_pending_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> EngineResult<Vec<String>> {
        let nos: Vec<String> = sqlx::query_scalar(
            "SELECT order_no FROM orders WHERE status = 'pending' AND created_at < $1 \
             ORDER BY created_at LIMIT $2",
        )
        .bind(created_before)
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        Ok(nos)
    }

    async fn get_goods(&self, id: GoodsId) -> EngineResult<Option<Goods>> {
        let row = sqlx::query(&format!("SELECT {GOODS_COLUMNS} FROM goods WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(goods_from_row).transpose()
    }

    async fn get_wallet(&self, user_id: UserId) -> EngineResult<Option<Wallet>> {
        let row = sqlx::query("SELECT user_id, balance, updated_at FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn ledger_entries(&self, user_id: UserId) -> EngineResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM wallet_ledger WHERE user_id = $1 ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;
        collect(&rows, ledger_from_row)
    }

    async fn orphaned_payments(
        &self,
        since: DateTime<Utc>,
        window: Duration,
    ) -> EngineResult<Vec<LedgerEntry>> {
        let window_secs = window.num_seconds() as f64;
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM wallet_ledger l \
             WHERE l.kind = 'order_payment' AND l.created_at >= $1 \
               AND NOT EXISTS ( \
                   SELECT 1 FROM orders o \
                   WHERE o.user_id = l.user_id AND o.total_amount = l.amount \
                     AND o.created_at BETWEEN l.created_at - make_interval(secs => $2) \
                                          AND l.created_at + make_interval(secs => $2)) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM wallet_ledger r \
                   WHERE r.kind = 'system_refund' AND r.ref_entry_id = l.id) \
             ORDER BY l.id"
        ))
        .bind(since)
        .bind(window_secs)
        .fetch_all(self.db.pool())
        .await?;
        collect(&rows, ledger_from_row)
    }

    async fn paid_orders_without_ledger(&self, since: DateTime<Utc>) -> EngineResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders o \
             WHERE o.status = 'paid' AND o.created_at >= $1 \
               AND NOT EXISTS (SELECT 1 FROM wallet_ledger l \
                               WHERE l.kind = 'order_payment' AND l.reference_no = o.order_no) \
               AND NOT EXISTS (SELECT 1 FROM order_status_history h \
                               WHERE h.order_no = o.order_no \
                                 AND h.from_status = 'pending' AND h.to_status = 'paid')"
        ))
        .bind(since)
        .fetch_all(self.db.pool())
        .await?;
        collect(&rows, order_from_row)
    }

    async fn negative_stock_goods(&self) -> EngineResult<Vec<Goods>> {
        let rows = sqlx::query(&format!("SELECT {GOODS_COLUMNS} FROM goods WHERE stock < 0"))
            .fetch_all(self.db.pool())
            .await?;
        collect(&rows, goods_from_row)
    }

    async fn get_room(&self, id: RoomId) -> EngineResult<Option<Room>> {
        let row = sqlx::query("SELECT id, room_number, name, hourly_rate, status FROM rooms WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn get_booking(&self, booking_no: &str) -> EngineResult<Option<Booking>> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM room_bookings WHERE booking_no = $1"
        ))
        .bind(booking_no)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn list_bookings(
        &self,
        user_id: UserId,
        status: Option<BookingStatus>,
        offset: u64,
        limit: u32,
    ) -> EngineResult<(Vec<Booking>, u64)> {
        let status = status.map(|s| s.id());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM room_bookings \
             WHERE user_id = $1 AND ($2::SMALLINT IS NULL OR status = $2)",
        )
        .bind(user_id)
        .bind(status)
        .fetch_one(self.db.pool())
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM room_bookings \
             WHERE user_id = $1 AND ($2::SMALLINT IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(user_id)
        .bind(status)
        .bind(i64::from(limit))
        .bind(offset as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok((collect(&rows, booking_from_row)?, total as u64))
    }

    async fn overlapping_bookings(
        &self,
        room_id: RoomId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Booking>> {
        let rows = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM room_bookings \
             WHERE room_id = $1 AND status IN ($2, $3) AND start_time < $5 AND end_time > $4"
        ))
        .bind(room_id)
        .bind(BookingStatus::Paid.id())
        .bind(BookingStatus::InUse.id())
        .bind(start)
        .bind(end)
        .fetch_all(self.db.pool())
        .await?;
        collect(&rows, booking_from_row)
    }

    async fn bookings_due_for_start(&self, now: DateTime<Utc>, limit: u32) -> EngineResult<Vec<String>> {
        let nos: Vec<String> = sqlx::query_scalar(
            "SELECT booking_no FROM room_bookings WHERE status = $1 AND start_time <= $2 \
             ORDER BY start_time LIMIT $3",
        )
        .bind(BookingStatus::Paid.id())
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        Ok(nos)
    }

    async fn bookings_due_for_end(&self, now: DateTime<Utc>, limit: u32) -> EngineResult<Vec<String>> {
        let nos: Vec<String> = sqlx::query_scalar(
            "SELECT booking_no FROM room_bookings WHERE status = $1 AND end_time <= $2 \
             ORDER BY end_time LIMIT $3",
        )
        .bind(BookingStatus::InUse.id())
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        Ok(nos)
    }

    async fn stale_pending_bookings(
        &self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> EngineResult<Vec<String>> {
        let nos: Vec<String> = sqlx::query_scalar(
            "SELECT booking_no FROM room_bookings WHERE status = $1 AND created_at <= $2 \
             ORDER BY created_at LIMIT $3",
        )
        .bind(BookingStatus::Pending.id())
        .bind(created_before)
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        Ok(nos)
    }

    async fn usage_log(&self, booking_id: BookingId) -> EngineResult<Option<UsageLog>> {
        let row = sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS} FROM room_usage_logs WHERE booking_id = $1"
        ))
        .bind(booking_id)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(usage_from_row).transpose()
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn goods_for_update(&mut self, id: GoodsId) -> EngineResult<Option<Goods>> {
        let row = sqlx::query(&format!(
            "SELECT {GOODS_COLUMNS} FROM goods WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(goods_from_row).transpose()
    }

    async fn decrement_stock(&mut self, id: GoodsId, qty: i32) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE goods SET stock = stock - $1, updated_at = NOW() \
             WHERE id = $2 AND stock >= $1 AND status = 'active' AND NOT deleted",
        )
        .bind(qty)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restore_stock(&mut self, id: GoodsId, qty: i32) -> EngineResult<()> {
        sqlx::query("UPDATE goods SET stock = stock + $1, updated_at = NOW() WHERE id = $2")
            .bind(qty)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn clamp_negative_stock(&mut self, id: GoodsId) -> EngineResult<bool> {
        let result =
            sqlx::query("UPDATE goods SET stock = 0, updated_at = NOW() WHERE id = $1 AND stock < 0")
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn wallet_for_update(&mut self, user_id: UserId) -> EngineResult<Option<Wallet>> {
        let row = sqlx::query(
            "SELECT user_id, balance, updated_at FROM wallets WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn ensure_wallet(&mut self, user_id: UserId, at: DateTime<Utc>) -> EngineResult<Wallet> {
        sqlx::query(
            "INSERT INTO wallets (user_id, balance, created_at, updated_at) \
             VALUES ($1, 0, $2, $2) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        self.wallet_for_update(user_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("wallet {user_id} vanished after insert")))
    }

    async fn debit_wallet(
        &mut self,
        user_id: UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE wallets SET balance = balance - $1, updated_at = $3 \
             WHERE user_id = $2 AND balance >= $1",
        )
        .bind(amount)
        .bind(user_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn credit_wallet(
        &mut self,
        user_id: UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO wallets (user_id, balance, created_at, updated_at) VALUES ($1, $2, $3, $3) \
             ON CONFLICT (user_id) DO UPDATE SET balance = wallets.balance + $2, updated_at = $3",
        )
        .bind(user_id)
        .bind(amount)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_ledger(&mut self, entry: NewLedgerEntry) -> EngineResult<LedgerId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO wallet_ledger \
                 (user_id, kind, amount, balance_before, balance_after, description, \
                  reference_no, ref_entry_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
        )
        .bind(entry.user_id)
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(&entry.description)
        .bind(&entry.reference_no)
        .bind(entry.ref_entry_id)
        .bind(entry.created_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn refund_exists(&mut self, entry_id: LedgerId) -> EngineResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM wallet_ledger WHERE kind = $1 AND ref_entry_id = $2)",
        )
        .bind(LedgerKind::SystemRefund.as_str())
        .bind(entry_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(found)
    }

    async fn insert_order(&mut self, order: NewOrder) -> EngineResult<Order> {
        let row = sqlx::query(&format!(
            "INSERT INTO orders \
                 (order_no, user_id, goods_id, merchant_id, quantity, unit_price, total_amount, \
                  status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING {ORDER_COLUMNS}"
        ))
        .bind(&order.order_no)
        .bind(order.user_id)
        .bind(order.goods_id)
        .bind(order.merchant_id)
        .bind(order.quantity)
        .bind(order.unit_price)
        .bind(order.total_amount)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .fetch_one(&mut *self.tx)
        .await?;
        order_from_row(&row)
    }

    async fn order_for_update(&mut self, order_no: &str) -> EngineResult<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1 FOR UPDATE"
        ))
        .bind(order_no)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn set_order_status(
        &mut self,
        order_no: &str,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let result = sqlx::query("UPDATE orders SET status = $1, updated_at = $2 WHERE order_no = $3")
            .bind(to.as_str())
            .bind(at)
            .bind(order_no)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("order {order_no}")));
        }
        Ok(())
    }

    async fn set_order_status_if(
        &mut self,
        order_no: &str,
        expected: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = $1, updated_at = $2 WHERE order_no = $3 AND status = $4",
        )
        .bind(to.as_str())
        .bind(at)
        .bind(order_no)
        .bind(expected.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_history(&mut self, entry: StatusHistoryEntry) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO order_status_history \
                 (order_no, from_status, to_status, operator, reason, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&entry.order_no)
        .bind(entry.from_status.as_str())
        .bind(entry.to_status.as_str())
        .bind(entry.operator.as_str())
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn record_merchant_stats(
        &mut self,
        merchant_id: MerchantId,
        order_no: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        // Savepoint: a failed statement must not abort the enclosing order insert.
        sqlx::query("SAVEPOINT merchant_stats")
            .execute(&mut *self.tx)
            .await?;
        let result = sqlx::query(
            "INSERT INTO merchant_stats (merchant_id, order_count, total_amount, last_order_no, updated_at) \
             VALUES ($1, 1, $2, $3, $4) \
             ON CONFLICT (merchant_id) DO UPDATE SET \
                 order_count = merchant_stats.order_count + 1, \
                 total_amount = merchant_stats.total_amount + $2, \
                 last_order_no = $3, updated_at = $4",
        )
        .bind(merchant_id)
        .bind(amount)
        .bind(order_no)
        .bind(at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT merchant_stats")
                    .execute(&mut *self.tx)
                    .await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = sqlx::query("ROLLBACK TO SAVEPOINT merchant_stats")
                    .execute(&mut *self.tx)
                    .await
                {
                    warn!(error = %rb, "Rollback to savepoint failed");
                }
                Err(e.into())
            }
        }
    }

    async fn room_for_update(&mut self, id: RoomId) -> EngineResult<Option<Room>> {
        let row = sqlx::query(
            "SELECT id, room_number, name, hourly_rate, status FROM rooms WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn set_room_status(
        &mut self,
        id: RoomId,
        status: RoomStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE rooms SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.id())
            .bind(at)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn booking_for_update(&mut self, booking_no: &str) -> EngineResult<Option<Booking>> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM room_bookings WHERE booking_no = $1 FOR UPDATE"
        ))
        .bind(booking_no)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn overlapping_bookings(
        &mut self,
        room_id: RoomId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Booking>> {
        let rows = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM room_bookings \
             WHERE room_id = $1 AND status IN ($2, $3) AND start_time < $5 AND end_time > $4"
        ))
        .bind(room_id)
        .bind(BookingStatus::Paid.id())
        .bind(BookingStatus::InUse.id())
        .bind(start)
        .bind(end)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(&rows, booking_from_row)
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> EngineResult<Booking> {
        let row = sqlx::query(&format!(
            "INSERT INTO room_bookings \
                 (booking_no, room_id, user_id, start_time, end_time, hours, total_amount, \
                  paid_amount, status, remarks, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, $10, $10) RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(&booking.booking_no)
        .bind(booking.room_id)
        .bind(booking.user_id)
        .bind(booking.start_time)
        .bind(booking.end_time)
        .bind(booking.hours)
        .bind(booking.total_amount)
        .bind(BookingStatus::Pending.id())
        .bind(&booking.remarks)
        .bind(booking.created_at)
        .fetch_one(&mut *self.tx)
        .await?;
        booking_from_row(&row)
    }

    async fn update_booking(&mut self, booking: &Booking) -> EngineResult<()> {
        sqlx::query(
            "UPDATE room_bookings SET status = $1, paid_amount = $2, remarks = $3, updated_at = $4 \
             WHERE booking_no = $5",
        )
        .bind(booking.status.id())
        .bind(booking.paid_amount)
        .bind(&booking.remarks)
        .bind(booking.updated_at)
        .bind(&booking.booking_no)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn count_in_use_bookings(
        &mut self,
        room_id: RoomId,
        exclude: BookingId,
    ) -> EngineResult<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM room_bookings WHERE room_id = $1 AND id <> $2 AND status = $3",
        )
        .bind(room_id)
        .bind(exclude)
        .bind(BookingStatus::InUse.id())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(n)
    }

    async fn insert_usage_log(
        &mut self,
        booking: &Booking,
        check_in_at: DateTime<Utc>,
    ) -> EngineResult<UsageLog> {
        let row = sqlx::query(&format!(
            "INSERT INTO room_usage_logs (room_id, booking_id, user_id, check_in_at) \
             VALUES ($1, $2, $3, $4) RETURNING {USAGE_COLUMNS}"
        ))
        .bind(booking.room_id)
        .bind(booking.id)
        .bind(booking.user_id)
        .bind(check_in_at)
        .fetch_one(&mut *self.tx)
        .await?;
        usage_from_row(&row)
    }

    async fn usage_log_for_update(
        &mut self,
        booking_id: BookingId,
    ) -> EngineResult<Option<UsageLog>> {
        let row = sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS} FROM room_usage_logs WHERE booking_id = $1 FOR UPDATE"
        ))
        .bind(booking_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(usage_from_row).transpose()
    }

    async fn close_usage_log(
        &mut self,
        id: i64,
        check_out_at: DateTime<Utc>,
        actual_hours: Decimal,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE room_usage_logs SET check_out_at = $1, actual_hours = $2, updated_at = NOW() \
             WHERE id = $3",
        )
        .bind(check_out_at)
        .bind(actual_hours)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
