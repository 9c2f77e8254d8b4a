//! orderflow - order lifecycle engine and room-booking scheduler
//!
//! # Modules
//!
//! - [`core_types`] - Id aliases
//! - [`money`] - Fixed-point amounts
//! - [`error`] - Engine error taxonomy
//! - [`kv`] - Key-value store (Redis or in-memory)
//! - [`lock`] - Distributed locks with renewal
//! - [`idempotency`] - Duplicate-submission marks
//! - [`store`] - Relational store (PostgreSQL or in-memory)
//! - [`order`] - Order engine, state machine, compensation
//! - [`expiry`] - Unpaid order expiry: queue, poller, timers
//! - [`booking`] - Room bookings and their scheduler
//! - [`system`] - Wiring and background workers

// Core types - must be first!
pub mod core_types;

pub mod clock;
pub mod error;
pub mod money;

// Backends
pub mod db;
pub mod kv;
pub mod store;

// Concurrency primitives
pub mod idempotency;
pub mod lock;

// Engines
pub mod booking;
pub mod expiry;
pub mod notify;
pub mod order;

// Runtime
pub mod config;
pub mod logging;
pub mod system;
pub mod worker;

// Convenient re-exports at crate root
pub use core_types::{BookingId, GoodsId, MerchantId, OrderId, RoomId, UserId};
pub use error::{EngineError, EngineResult};
pub use order::{Operator, OrderEngine, OrderStatus};
pub use system::{HealthReport, HealthStatus, OrderSystem};
