//! Core identifier types shared by every module.
//!
//! All ids map onto PostgreSQL `BIGINT` columns, hence signed 64-bit.

/// User ID - the authenticated caller, supplied by the HTTP layer.
pub type UserId = i64;

/// Catalog item id (`goods.id`).
pub type GoodsId = i64;

/// Merchant (tenant) owning a good; orders inherit it for revenue stats.
pub type MerchantId = i64;

/// Internal numeric order id. The public identity is the `order_no` string.
pub type OrderId = i64;

/// Room id (`rooms.id`).
pub type RoomId = i64;

/// Internal numeric booking id. The public identity is the `booking_no` string.
pub type BookingId = i64;

/// Auto-increment id of an append-only ledger row.
pub type LedgerId = i64;
