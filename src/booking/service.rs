//! Booking Service
//!
//! Request-side booking operations. Slot checks run under the per-room lock;
//! status changes under the per-booking lock, re-validated on the locked row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use validator::Validate;

use crate::clock::Clock;
use crate::config::BookingConfig;
use crate::core_types::{RoomId, UserId};
use crate::error::{EngineError, EngineResult};
use crate::lock::{self, LockHandle, LockManager, keys};
use crate::money;
use crate::notify::{EventType, Notification, Notifier};
use crate::order::model::{LedgerKind, ListQuery, Paged};
use crate::order::wallet::{self, Debit, RetryPolicy};
use crate::store::{Store, StoreTx, rollback_quietly};

use super::lifecycle;
use super::model::{
    Booking, BookingStatus, BookingStatusInfo, CreateBookingRequest, NewBooking, RoomStatus,
};

pub struct BookingService {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: BookingConfig,
    retry: RetryPolicy,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<LockManager>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: BookingConfig,
    ) -> Self {
        Self {
            store,
            locks,
            notifier,
            clock,
            config,
            retry: RetryPolicy::default(),
        }
    }

    async fn lock(&self, key: &str) -> EngineResult<LockHandle> {
        self.locks
            .acquire_timeout(key, self.config.lock_ttl(), self.config.lock_wait(), true)
            .await
    }

    /// Reserve `[start, start + hours)` as a pending booking.
    pub async fn create_booking(
        &self,
        user_id: UserId,
        req: CreateBookingRequest,
    ) -> EngineResult<Booking> {
        req.validate()?;
        let now = self.clock.now();
        if req.start_time < now {
            return Err(EngineError::InvalidArgument("start_time is in the past".into()));
        }
        let end = req.start_time + Duration::hours(i64::from(req.hours));

        let handle = self.lock(&keys::room_booking(req.room_id)).await?;
        let result = self.create_in_tx(user_id, &req, end, now).await;
        lock::release_quietly(handle).await;
        let booking = result?;

        info!(
            booking_no = %booking.booking_no,
            room_id = booking.room_id,
            user_id,
            hours = booking.hours,
            total = %booking.total_amount,
            "Booking created"
        );
        self.notify(&booking, EventType::BookingCreated);
        Ok(booking)
    }

    async fn create_in_tx(
        &self,
        user_id: UserId,
        req: &CreateBookingRequest,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<Booking> {
        let mut tx = self.store.begin().await?;
        match create_steps(&mut *tx, user_id, req, end, now).await {
            Ok(b) => {
                tx.commit().await?;
                Ok(b)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    /// Pay a pending booking from the user's wallet. The slot is re-checked:
    /// of two overlapping pending bookings only the first paid one wins.
    pub async fn pay_booking(&self, booking_no: &str, amount: Decimal) -> EngineResult<Booking> {
        money::validate_payment(amount)?;
        let room_id = self.find(booking_no).await?.room_id;

        let room_lock = self.lock(&keys::room_booking(room_id)).await?;
        let result = self.locked(booking_no, Action::Pay(amount)).await;
        lock::release_quietly(room_lock).await;
        let (booking, paid) = result?;

        info!(booking_no = %booking_no, amount = %paid, "Booking paid");
        self.notify(&booking, EventType::BookingPaid);
        Ok(booking)
    }

    /// Cancel a pending or paid booking. With `user_id` the caller must own
    /// it; without, it is an operator action.
    pub async fn cancel_booking(
        &self,
        user_id: Option<UserId>,
        booking_no: &str,
        reason: &str,
    ) -> EngineResult<Booking> {
        if let Some(uid) = user_id {
            if self.find(booking_no).await?.user_id != uid {
                return Err(EngineError::Forbidden(format!("booking {booking_no}")));
            }
        }
        let (booking, refunded) = self.locked(booking_no, Action::Cancel(reason)).await?;
        info!(booking_no = %booking_no, refunded = %refunded, "Booking cancelled");
        self.notify(&booking, EventType::BookingCancelled);
        Ok(booking)
    }

    /// Refund a paid, in-use or completed booking in full.
    pub async fn refund_booking(&self, booking_no: &str, reason: &str) -> EngineResult<Booking> {
        let (booking, refunded) = self.locked(booking_no, Action::Refund(reason)).await?;
        info!(booking_no = %booking_no, refunded = %refunded, "Booking refunded");
        self.notify(&booking, EventType::BookingRefunded);
        Ok(booking)
    }

    /// Admin check-in ahead of the scheduler.
    pub async fn manually_start(&self, booking_no: &str) -> EngineResult<Booking> {
        let (booking, _) = self.locked(booking_no, Action::Start).await?;
        info!(booking_no = %booking_no, room_id = booking.room_id, "Booking started manually");
        self.notify(&booking, EventType::BookingStarted);
        Ok(booking)
    }

    /// Admin check-out ahead of the scheduler.
    pub async fn manually_end(&self, booking_no: &str) -> EngineResult<Booking> {
        let (booking, hours) = self.locked(booking_no, Action::End).await?;
        info!(booking_no = %booking_no, actual_hours = %hours, "Booking ended manually");
        self.notify(&booking, EventType::BookingCompleted);
        Ok(booking)
    }

    pub async fn booking_status_info(&self, booking_no: &str) -> EngineResult<BookingStatusInfo> {
        let booking = self.find(booking_no).await?;
        Ok(BookingStatusInfo::evaluate(&booking, self.clock.now()))
    }

    /// Owner-only; other users' bookings read as not found.
    pub async fn get_booking(&self, user_id: UserId, booking_no: &str) -> EngineResult<Booking> {
        match self.store.get_booking(booking_no).await? {
            Some(b) if b.user_id == user_id => Ok(b),
            _ => Err(EngineError::NotFound(format!("booking {booking_no}"))),
        }
    }

    pub async fn list_bookings(
        &self,
        user_id: UserId,
        query: ListQuery<BookingStatus>,
    ) -> EngineResult<Paged<Booking>> {
        let (page, page_size) = query.normalized();
        let (items, total) = self
            .store
            .list_bookings(user_id, query.status, query.offset(), page_size)
            .await?;
        Ok(Paged {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Whether `[start, end)` is free on a bookable room.
    pub async fn check_availability(
        &self,
        room_id: RoomId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<bool> {
        if end <= start {
            return Err(EngineError::InvalidArgument("end must be after start".into()));
        }
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("room {room_id}")))?;
        if !is_bookable(room.status) {
            return Ok(false);
        }
        Ok(self
            .store
            .overlapping_bookings(room_id, start, end)
            .await?
            .is_empty())
    }

    async fn find(&self, booking_no: &str) -> EngineResult<Booking> {
        self.store
            .get_booking(booking_no)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("booking {booking_no}")))
    }

    /// Apply `action` to the locked row under the per-booking lock.
    async fn locked(&self, booking_no: &str, action: Action<'_>) -> EngineResult<(Booking, Decimal)> {
        let handle = self.lock(&keys::booking(booking_no)).await?;
        let result = self.apply_in_tx(booking_no, action).await;
        lock::release_quietly(handle).await;
        result
    }

    async fn apply_in_tx(&self, booking_no: &str, action: Action<'_>) -> EngineResult<(Booking, Decimal)> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        match apply_action(&mut *tx, booking_no, action, now, self.retry).await {
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

    fn notify(&self, booking: &Booking, event: EventType) {
        self.notifier.notify(Notification::new(
            booking.user_id,
            booking.booking_no.clone(),
            event,
            serde_json::json!({
                "room_id": booking.room_id,
                "status": booking.status,
                "start_time": booking.start_time,
                "end_time": booking.end_time,
                "total_amount": money::format_amount(booking.total_amount),
            }),
        ));
    }
}

/// Maintenance and disabled rooms take no bookings. An occupied room is only
/// busy for its current slot.
fn is_bookable(status: RoomStatus) -> bool {
    matches!(status, RoomStatus::Available | RoomStatus::Occupied)
}

#[derive(Debug, Clone, Copy)]
enum Action<'a> {
    Pay(Decimal),
    Cancel(&'a str),
    Refund(&'a str),
    Start,
    End,
}

async fn create_steps(
    tx: &mut dyn StoreTx,
    user_id: UserId,
    req: &CreateBookingRequest,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> EngineResult<Booking> {
    let room = tx
        .room_for_update(req.room_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("room {}", req.room_id)))?;
    if !is_bookable(room.status) {
        return Err(EngineError::RoomUnavailable(format!("room {}", room.id)));
    }
    if !tx
        .overlapping_bookings(room.id, req.start_time, end)
        .await?
        .is_empty()
    {
        return Err(EngineError::RoomUnavailable(format!("room {}", room.id)));
    }
    let total = money::line_total(room.hourly_rate, req.hours)?;
    tx.insert_booking(NewBooking {
        booking_no: new_booking_no(),
        room_id: room.id,
        user_id,
        start_time: req.start_time,
        end_time: end,
        hours: req.hours,
        total_amount: total,
        remarks: req.remarks.clone(),
        created_at: now,
    })
    .await
}

/// Returns the row after the action plus the amount paid, the amount
/// refunded or the billed hours, depending on the action.
async fn apply_action(
    tx: &mut dyn StoreTx,
    booking_no: &str,
    action: Action<'_>,
    now: DateTime<Utc>,
    retry: RetryPolicy,
) -> EngineResult<(Booking, Decimal)> {
    let mut booking = tx
        .booking_for_update(booking_no)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("booking {booking_no}")))?;

    let figure = match action {
        Action::Pay(amount) => pay_steps(tx, &mut booking, amount, now, retry).await?,
        Action::Cancel(reason) => lifecycle::cancel(tx, &mut booking, reason, now).await?,
        Action::Refund(reason) => lifecycle::refund(tx, &mut booking, reason, now).await?,
        Action::Start => {
            if booking.status != BookingStatus::Paid {
                return Err(EngineError::InvalidState(format!(
                    "booking {booking_no} is {}, only paid bookings can start",
                    booking.status
                )));
            }
            lifecycle::start(tx, &mut booking, now).await?;
            Decimal::ZERO
        }
        Action::End => {
            if booking.status != BookingStatus::InUse {
                return Err(EngineError::InvalidState(format!(
                    "booking {booking_no} is {}, only in-use bookings can end",
                    booking.status
                )));
            }
            lifecycle::complete(tx, &mut booking, now).await?
        }
    };
    Ok((booking, figure))
}

async fn pay_steps(
    tx: &mut dyn StoreTx,
    booking: &mut Booking,
    amount: Decimal,
    now: DateTime<Utc>,
    retry: RetryPolicy,
) -> EngineResult<Decimal> {
    if booking.status != BookingStatus::Pending {
        return Err(EngineError::InvalidState(format!(
            "booking {} is {}",
            booking.booking_no, booking.status
        )));
    }
    if money::to_storage(amount) != booking.total_amount {
        return Err(EngineError::AmountMismatch {
            expected: booking.total_amount,
            actual: amount,
        });
    }
    let clash = tx
        .overlapping_bookings(booking.room_id, booking.start_time, booking.end_time)
        .await?
        .into_iter()
        .any(|b| b.id != booking.id);
    if clash {
        warn!(booking_no = %booking.booking_no, room_id = booking.room_id, "Slot taken by another paid booking");
        return Err(EngineError::RoomUnavailable(format!("room {}", booking.room_id)));
    }
    wallet::debit(
        tx,
        Debit {
            user_id: booking.user_id,
            amount: booking.total_amount,
            kind: LedgerKind::BookingPayment,
            description: "room booking payment",
            reference_no: &booking.booking_no,
        },
        now,
        retry,
    )
    .await?;
    booking.paid_amount = booking.total_amount;
    booking.status = BookingStatus::Paid;
    booking.updated_at = now;
    tx.update_booking(booking).await?;
    Ok(booking.paid_amount)
}

/// `BK` + ULID.
pub fn new_booking_no() -> String {
    format!("BK{}", ulid::Ulid::new())
}
