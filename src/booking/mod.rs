//! Room bookings: model, transition table, service and wall-clock scheduler.

pub mod lifecycle;
pub mod model;
pub mod scheduler;
pub mod service;
pub mod transitions;

pub use model::{
    Booking, BookingStatus, BookingStatusInfo, CreateBookingRequest, Room, RoomStatus, UsageLog,
};
pub use scheduler::{BookingScheduler, TickReport};
pub use service::BookingService;
