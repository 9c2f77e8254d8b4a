//! Money Module
//!
//! Every amount in the engine is a `rust_decimal::Decimal` with exactly two
//! fractional digits, matching the `NUMERIC(12,2)` columns. All arithmetic that
//! produces a stored amount MUST go through this module.
//!
//! ## Rules
//! 1. Client amounts with more than two decimals are rejected, never truncated.
//! 2. Zero and negative amounts are rejected where an amount is a payment.
//! 3. Multiplication is checked; overflow is an error.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use thiserror::Error;

/// Fractional digits of every stored amount.
pub const SCALE: u32 = 2;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

// ============================================================================
// Parse: Client → Internal
// ============================================================================

/// Parse a client-supplied amount string such as `"12.5"` or `"100"`.
///
/// Strict: `.5` and `5.` are rejected, as is anything beyond two decimals.
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }
    if amount_str.starts_with('.') || amount_str.ends_with('.') {
        return Err(MoneyError::InvalidFormat(
            "both sides of the decimal point are required".into(),
        ));
    }

    let value = Decimal::from_str(amount_str)
        .map_err(|e| MoneyError::InvalidFormat(format!("{}: {}", amount_str, e)))?;
    validate_payment(value)
}

/// Validate an already-typed amount used as a payment or credit.
pub fn validate_payment(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount.is_sign_negative() || amount.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }
    let normalized = amount.normalize();
    if normalized.scale() > SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: SCALE,
        });
    }
    Ok(to_storage(amount))
}

// ============================================================================
// Arithmetic
// ============================================================================

/// Round half away from zero to the storage scale.
pub fn to_storage(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(SCALE);
    rounded
}

/// `unit_price × quantity`, checked.
pub fn line_total(unit_price: Decimal, quantity: i32) -> Result<Decimal, MoneyError> {
    if quantity <= 0 {
        return Err(MoneyError::InvalidAmount);
    }
    unit_price
        .checked_mul(Decimal::from(quantity))
        .map(to_storage)
        .ok_or(MoneyError::Overflow)
}

/// Elapsed wall-clock hours between two instants, rounded to the storage scale.
///
/// Negative spans clamp to zero.
pub fn elapsed_hours(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    let millis = (to - from).num_milliseconds().max(0);
    to_storage(Decimal::from(millis) / Decimal::from(3_600_000))
}

/// Display with exactly two decimals: `12.3` → `"12.30"`.
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", to_storage(amount))
}
