//! Order, catalog and wallet records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core_types::{GoodsId, LedgerId, MerchantId, OrderId, UserId};

use super::status::{Operator, OrderStatus};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoodsStatus {
    Active,
    OffShelf,
}

impl GoodsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoodsStatus::Active => "active",
            GoodsStatus::OffShelf => "off_shelf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(GoodsStatus::Active),
            "off_shelf" => Some(GoodsStatus::OffShelf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goods {
    pub id: GoodsId,
    pub merchant_id: MerchantId,
    pub name: String,
    pub unit_price: Decimal,
    pub stock: i32,
    pub status: GoodsStatus,
    pub deleted: bool,
}

impl Goods {
    /// On shelf and not soft-deleted.
    pub fn is_sellable(&self) -> bool {
        self.status == GoodsStatus::Active && !self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// Debit
    OrderPayment,
    /// Debit
    BookingPayment,
    /// Credit
    SystemRefund,
    /// Credit
    Recharge,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::OrderPayment => "order_payment",
            LedgerKind::BookingPayment => "booking_payment",
            LedgerKind::SystemRefund => "system_refund",
            LedgerKind::Recharge => "recharge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order_payment" => Some(LedgerKind::OrderPayment),
            "booking_payment" => Some(LedgerKind::BookingPayment),
            "system_refund" => Some(LedgerKind::SystemRefund),
            "recharge" => Some(LedgerKind::Recharge),
            _ => None,
        }
    }

    /// -1 for debits, +1 for credits.
    pub fn sign(&self) -> Decimal {
        match self {
            LedgerKind::OrderPayment | LedgerKind::BookingPayment => Decimal::NEGATIVE_ONE,
            LedgerKind::SystemRefund | LedgerKind::Recharge => Decimal::ONE,
        }
    }
}

/// Append-only wallet movement. `amount` is always positive; direction
/// comes from `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerId,
    pub user_id: UserId,
    pub kind: LedgerKind,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    /// Order or booking this movement belongs to, if any.
    pub reference_no: Option<String>,
    /// For compensating entries: the entry being compensated.
    pub ref_entry_id: Option<LedgerId>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// `balance_before + sign * amount == balance_after`
    pub fn is_consistent(&self) -> bool {
        self.balance_before + self.kind.sign() * self.amount == self.balance_after
    }
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub kind: LedgerKind,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub reference_no: Option<String>,
    pub ref_entry_id: Option<LedgerId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_no: String,
    pub user_id: UserId,
    pub goods_id: GoodsId,
    pub merchant_id: MerchantId,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_no: String,
    pub user_id: UserId,
    pub goods_id: GoodsId,
    pub merchant_id: MerchantId,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub order_no: String,
    pub from_status: OrderStatus,
    pub to_status: OrderStatus,
    pub operator: Operator,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Inbound create-order payload.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(range(min = 1, message = "goods_id must be positive"))]
    pub goods_id: GoodsId,
    #[validate(range(min = 1, max = 9999, message = "quantity must be between 1 and 9999"))]
    pub quantity: i32,
}

/// Page query shared by order and booking listings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery<S> {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub status: Option<S>,
}

impl<S> Default for ListQuery<S> {
    fn default() -> Self {
        Self {
            page: None,
            page_size: None,
            status: None,
        }
    }
}

impl<S> ListQuery<S> {
    /// `(page, page_size)` with defaults applied and size capped.
    pub fn normalized(&self) -> (u32, u32) {
        let page = self.page.filter(|p| *p > 0).unwrap_or(DEFAULT_PAGE);
        let size = self
            .page_size
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE);
        (page, size)
    }

    pub fn offset(&self) -> u64 {
        let (page, size) = self.normalized();
        u64::from(page - 1) * u64::from(size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Order as shown to its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    pub id: OrderId,
    pub order_no: String,
    pub goods_id: GoodsId,
    pub quantity: i32,
    pub unit_price: String,
    pub total_amount: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(o: &Order) -> Self {
        Self {
            id: o.id,
            order_no: o.order_no.clone(),
            goods_id: o.goods_id,
            quantity: o.quantity,
            unit_price: crate::money::format_amount(o.unit_price),
            total_amount: crate::money::format_amount(o.total_amount),
            status: o.status,
            created_at: o.created_at,
            updated_at: o.updated_at,
        }
    }
}

pub type PagedOrders = Paged<OrderView>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_consistency() {
        let entry = LedgerEntry {
            id: 1,
            user_id: 1,
            kind: LedgerKind::OrderPayment,
            amount: Decimal::new(3000, 2),
            balance_before: Decimal::new(10000, 2),
            balance_after: Decimal::new(7000, 2),
            description: "order payment".into(),
            reference_no: None,
            ref_entry_id: None,
            created_at: Utc::now(),
        };
        assert!(entry.is_consistent());

        let refund = LedgerEntry {
            kind: LedgerKind::SystemRefund,
            balance_before: Decimal::new(7000, 2),
            balance_after: Decimal::new(10000, 2),
            ..entry
        };
        assert!(refund.is_consistent());
    }

    #[test]
    fn test_list_query_defaults() {
        let q: ListQuery<OrderStatus> = ListQuery::default();
        assert_eq!(q.normalized(), (1, 10));
        assert_eq!(q.offset(), 0);

        let q = ListQuery::<OrderStatus> {
            page: Some(3),
            page_size: Some(500),
            status: None,
        };
        assert_eq!(q.normalized(), (3, 100));
        assert_eq!(q.offset(), 200);
    }

    #[test]
    fn test_create_request_validation() {
        let ok = CreateOrderRequest { goods_id: 1, quantity: 2 };
        assert!(ok.validate().is_ok());
        let bad = CreateOrderRequest { goods_id: 0, quantity: 0 };
        let errs = bad.validate().unwrap_err();
        assert!(errs.field_errors().contains_key("goods_id"));
        assert!(errs.field_errors().contains_key("quantity"));
    }

    #[test]
    fn test_goods_sellable() {
        let mut g = Goods {
            id: 1,
            merchant_id: 1,
            name: "tea".into(),
            unit_price: Decimal::ONE,
            stock: 1,
            status: GoodsStatus::Active,
            deleted: false,
        };
        assert!(g.is_sellable());
        g.deleted = true;
        assert!(!g.is_sellable());
        g.deleted = false;
        g.status = GoodsStatus::OffShelf;
        assert!(!g.is_sellable());
    }
}
