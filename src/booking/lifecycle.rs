//! Booking transitions with their side effects, applied inside the caller's
//! transaction. Shared by the service (manual actions) and the scheduler.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};
use crate::money;
use crate::order::model::LedgerKind;
use crate::order::wallet::{self, Credit};
use crate::store::StoreTx;

use super::model::{Booking, BookingStatus, Room, RoomStatus};
use super::transitions;

pub(crate) fn append_remark(remarks: &str, note: &str) -> String {
    if remarks.is_empty() {
        note.to_string()
    } else {
        format!("{remarks}; {note}")
    }
}

/// paid -> in_use: room occupied, usage log opened.
pub(crate) async fn start(
    tx: &mut dyn StoreTx,
    booking: &mut Booking,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    transitions::validate(booking.status, BookingStatus::InUse)?;
    // Room row first: serializes with release_room on the same room.
    lock_room(tx, booking).await?;
    booking.status = BookingStatus::InUse;
    booking.updated_at = now;
    tx.update_booking(booking).await?;
    tx.set_room_status(booking.room_id, RoomStatus::Occupied, now)
        .await?;
    tx.insert_usage_log(booking, now).await?;
    Ok(())
}

/// in_use -> completed: usage log closed, room freed if nobody else is in it.
/// Returns the billed hours.
pub(crate) async fn complete(
    tx: &mut dyn StoreTx,
    booking: &mut Booking,
    now: DateTime<Utc>,
) -> EngineResult<Decimal> {
    transitions::validate(booking.status, BookingStatus::Completed)?;
    booking.status = BookingStatus::Completed;
    booking.updated_at = now;
    tx.update_booking(booking).await?;
    let hours = close_usage(tx, booking, now).await?;
    release_room(tx, booking, now).await?;
    Ok(hours)
}

/// pending/paid -> cancelled, paid amount back to the wallet.
pub(crate) async fn cancel(
    tx: &mut dyn StoreTx,
    booking: &mut Booking,
    reason: &str,
    now: DateTime<Utc>,
) -> EngineResult<Decimal> {
    transitions::validate(booking.status, BookingStatus::Cancelled)?;
    let refunded = refund_paid(tx, booking, "booking cancelled", now).await?;
    booking.status = BookingStatus::Cancelled;
    booking.remarks = append_remark(&booking.remarks, reason);
    booking.updated_at = now;
    tx.update_booking(booking).await?;
    Ok(refunded)
}

/// paid/in_use/completed -> refunded. An in-use booking is checked out first.
pub(crate) async fn refund(
    tx: &mut dyn StoreTx,
    booking: &mut Booking,
    reason: &str,
    now: DateTime<Utc>,
) -> EngineResult<Decimal> {
    transitions::validate(booking.status, BookingStatus::Refunded)?;
    let was_in_use = booking.status == BookingStatus::InUse;
    let refunded = refund_paid(tx, booking, "booking refunded", now).await?;
    booking.status = BookingStatus::Refunded;
    booking.remarks = append_remark(&booking.remarks, reason);
    booking.updated_at = now;
    tx.update_booking(booking).await?;
    if was_in_use {
        close_usage(tx, booking, now).await?;
        release_room(tx, booking, now).await?;
    }
    Ok(refunded)
}

async fn close_usage(
    tx: &mut dyn StoreTx,
    booking: &Booking,
    now: DateTime<Utc>,
) -> EngineResult<Decimal> {
    match tx.usage_log_for_update(booking.id).await? {
        Some(log) if log.check_out_at.is_none() => {
            let hours = money::elapsed_hours(log.check_in_at, now);
            tx.close_usage_log(log.id, now, hours).await?;
            Ok(hours)
        }
        // No check-in recorded: bill the booked hours.
        _ => Ok(Decimal::from(booking.hours)),
    }
}

/// Occupied -> available once no other in-use booking references the room.
async fn release_room(
    tx: &mut dyn StoreTx,
    booking: &Booking,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    // Count only under the room lock, or a concurrent start/complete on the
    // same room is missed.
    let room = lock_room(tx, booking).await?;
    if tx.count_in_use_bookings(booking.room_id, booking.id).await? > 0 {
        return Ok(());
    }
    if room.status == RoomStatus::Occupied {
        tx.set_room_status(room.id, RoomStatus::Available, now).await?;
    }
    Ok(())
}

async fn lock_room(tx: &mut dyn StoreTx, booking: &Booking) -> EngineResult<Room> {
    tx.room_for_update(booking.room_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("room {}", booking.room_id)))
}

async fn refund_paid(
    tx: &mut dyn StoreTx,
    booking: &Booking,
    description: &str,
    now: DateTime<Utc>,
) -> EngineResult<Decimal> {
    if booking.paid_amount <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    wallet::credit(
        tx,
        Credit {
            user_id: booking.user_id,
            amount: booking.paid_amount,
            kind: LedgerKind::SystemRefund,
            description,
            reference_no: Some(&booking.booking_no),
            ref_entry_id: None,
        },
        now,
    )
    .await?;
    Ok(booking.paid_amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_remark() {
        assert_eq!(append_remark("", "timeout"), "timeout");
        assert_eq!(append_remark("window seat", "timeout"), "window seat; timeout");
    }
}
