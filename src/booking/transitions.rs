//! Booking transition table.

use crate::error::{EngineError, EngineResult};

use super::model::BookingStatus;

/// `pending -> paid -> in_use -> completed`, with `cancelled` from
/// pending/paid and `refunded` from paid/in_use/completed.
pub fn is_allowed(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;

    matches!(
        (from, to),
        (Pending, Paid)
            | (Paid, InUse)
            | (InUse, Completed)
            | (Pending, Cancelled)
            | (Paid, Cancelled)
            | (Paid, Refunded)
            | (InUse, Refunded)
            | (Completed, Refunded)
    )
}

pub fn validate(from: BookingStatus, to: BookingStatus) -> EngineResult<()> {
    if is_allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidState(format!(
            "booking cannot move from {from} to {to}"
        )))
    }
}
