//! Room and booking records.
//!
//! Status IDs are stored as SMALLINT.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core_types::{BookingId, RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum RoomStatus {
    Available = 1,
    /// Held by at least one in-use booking
    Occupied = 2,
    Maintenance = 3,
    Disabled = 4,
}

impl RoomStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(RoomStatus::Available),
            2 => Some(RoomStatus::Occupied),
            3 => Some(RoomStatus::Maintenance),
            4 => Some(RoomStatus::Disabled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Available => "available",
            RoomStatus::Occupied => "occupied",
            RoomStatus::Maintenance => "maintenance",
            RoomStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Booking FSM states.
///
/// Terminal: COMPLETED is terminal for the normal flow but may still be
/// refunded; CANCELLED and REFUNDED are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum BookingStatus {
    Pending = 1,
    Paid = 2,
    InUse = 3,
    Completed = 4,
    Cancelled = 5,
    Refunded = 6,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 6] = [
        BookingStatus::Pending,
        BookingStatus::Paid,
        BookingStatus::InUse,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::Refunded,
    ];

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Paid => "paid",
            BookingStatus::InUse => "in_use",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Refunded => "refunded",
        }
    }

    /// Statuses that claim the room's time slot.
    #[inline]
    pub fn blocks_slot(&self) -> bool {
        matches!(self, BookingStatus::Paid | BookingStatus::InUse)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub room_number: String,
    pub name: String,
    pub hourly_rate: Decimal,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub booking_no: String,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub hours: i32,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub status: BookingStatus,
    pub remarks: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Half-open interval overlap with `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time
    }
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub booking_no: String,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub hours: i32,
    pub total_amount: Decimal,
    pub remarks: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: i64,
    pub booking_id: BookingId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub check_in_at: DateTime<Utc>,
    pub check_out_at: Option<DateTime<Utc>>,
    pub actual_hours: Decimal,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBookingRequest {
    #[validate(range(min = 1, message = "room_id must be positive"))]
    pub room_id: RoomId,
    pub start_time: DateTime<Utc>,
    #[validate(range(min = 1, max = 24, message = "hours must be between 1 and 24"))]
    pub hours: i32,
    #[validate(length(max = 500))]
    #[serde(default)]
    pub remarks: String,
}

/// What an operator may do with a booking right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingStatusInfo {
    pub booking_no: String,
    pub status: BookingStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub can_start: bool,
    pub can_end: bool,
    pub should_auto_start: bool,
    pub should_auto_end: bool,
}

impl BookingStatusInfo {
    pub fn evaluate(booking: &Booking, now: DateTime<Utc>) -> Self {
        let can_start = booking.status == BookingStatus::Paid;
        let can_end = booking.status == BookingStatus::InUse;
        Self {
            booking_no: booking.booking_no.clone(),
            status: booking.status,
            start_time: booking.start_time,
            end_time: booking.end_time,
            can_start,
            can_end,
            should_auto_start: can_start && booking.start_time <= now,
            should_auto_end: can_end && booking.end_time <= now,
        }
    }
}
