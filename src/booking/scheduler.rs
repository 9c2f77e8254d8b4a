//! Booking Scheduler
//!
//! Wall-clock driver of the booking lifecycle. Each tick activates due paid
//! bookings, completes finished ones and cancels stale pending ones. Every
//! booking is handled in its own transaction; a failure is logged and the
//! booking is picked up again by the next tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::BookingConfig;
use crate::error::{EngineError, EngineResult};
use crate::lock::{self, LockHandle, LockManager, keys};
use crate::notify::{EventType, Notification, Notifier};
use crate::store::{Store, StoreTx, rollback_quietly};
use crate::worker::{Shutdown, sleep_or_shutdown};

use super::lifecycle;
use super::model::{Booking, BookingStatus};

const STALE_REASON: &str = "cancelled: unpaid for over 24 hours";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Activate,
    Complete,
    CancelStale,
}

impl Step {
    fn as_str(&self) -> &'static str {
        match self {
            Step::Activate => "activate",
            Step::Complete => "complete",
            Step::CancelStale => "cancel_stale",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub started: Vec<String>,
    pub completed: Vec<String>,
    pub cancelled: Vec<String>,
    /// Errors and bookings skipped because another worker held them.
    pub failed: usize,
}

pub struct BookingScheduler {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: BookingConfig,
}

impl BookingScheduler {
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
        }
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(tick_secs = self.config.tick_secs, "Starting booking scheduler");
        loop {
            let now = self.clock.now();
            match self.tick(now).await {
                Ok(r) if r.started.len() + r.completed.len() + r.cancelled.len() > 0 => info!(
                    started = r.started.len(),
                    completed = r.completed.len(),
                    cancelled = r.cancelled.len(),
                    failed = r.failed,
                    "Booking tick"
                ),
                Ok(_) => debug!("Booking tick idle"),
                Err(e) => error!(error = %e, "Booking tick failed"),
            }
            if sleep_or_shutdown(&mut shutdown, self.config.tick()).await {
                break;
            }
        }
    }

    /// One pass at `now`. Only the selection queries can fail the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        let mut report = TickReport::default();

        let due = self
            .store
            .bookings_due_for_start(now, self.config.batch)
            .await?;
        for no in due {
            if self.process(&no, Step::Activate, now).await {
                report.started.push(no);
            } else {
                report.failed += 1;
            }
        }

        let finished = self.store.bookings_due_for_end(now, self.config.batch).await?;
        for no in finished {
            if self.process(&no, Step::Complete, now).await {
                report.completed.push(no);
            } else {
                report.failed += 1;
            }
        }

        let stale = self
            .store
            .stale_pending_bookings(now - self.config.stale_pending(), self.config.batch)
            .await?;
        for no in stale {
            if self.process(&no, Step::CancelStale, now).await {
                report.cancelled.push(no);
            } else {
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// `true` if the step was applied.
    async fn process(&self, booking_no: &str, step: Step, now: DateTime<Utc>) -> bool {
        let handle = match self.lock(booking_no).await {
            Ok(h) => h,
            Err(EngineError::AlreadyHeld(_)) => {
                debug!(booking_no = %booking_no, step = step.as_str(), "Booking busy, next tick");
                return false;
            }
            Err(e) => {
                warn!(booking_no = %booking_no, step = step.as_str(), error = %e, "Booking lock failed");
                return false;
            }
        };

        let result = self.apply(booking_no, step, now).await;
        if let Some(h) = handle {
            lock::release_quietly(h).await;
        }

        match result {
            Ok(Some(booking)) => {
                info!(
                    booking_no = %booking_no,
                    room_id = booking.room_id,
                    step = step.as_str(),
                    status = %booking.status,
                    "Booking transitioned"
                );
                self.notify(&booking, step);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(booking_no = %booking_no, step = step.as_str(), error = %e, "Booking transition failed");
                false
            }
        }
    }

    /// `None` when the lock backend is down; the row lock still serializes.
    async fn lock(&self, booking_no: &str) -> EngineResult<Option<LockHandle>> {
        match self
            .locks
            .acquire(&keys::booking(booking_no), self.config.lock_ttl())
            .await
        {
            Ok(h) => Ok(Some(h)),
            Err(EngineError::LockBackendUnavailable(msg)) => {
                warn!(booking_no = %booking_no, error = %msg, "Lock backend unavailable, relying on row locks");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(
        &self,
        booking_no: &str,
        step: Step,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Booking>> {
        let mut tx = self.store.begin().await?;
        match self.apply_steps(&mut *tx, booking_no, step, now).await {
            Ok(Some(booking)) => {
                tx.commit().await?;
                Ok(Some(booking))
            }
            Ok(None) => {
                rollback_quietly(tx).await;
                Ok(None)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn apply_steps(
        &self,
        tx: &mut dyn StoreTx,
        booking_no: &str,
        step: Step,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Booking>> {
        let Some(mut booking) = tx.booking_for_update(booking_no).await? else {
            return Ok(None);
        };
        // Re-check under the row lock; another worker may have moved it.
        match step {
            Step::Activate => {
                if booking.status != BookingStatus::Paid || booking.start_time > now {
                    return Ok(None);
                }
                lifecycle::start(tx, &mut booking, now).await?;
            }
            Step::Complete => {
                if booking.status != BookingStatus::InUse || booking.end_time > now {
                    return Ok(None);
                }
                lifecycle::complete(tx, &mut booking, now).await?;
            }
            Step::CancelStale => {
                if booking.status != BookingStatus::Pending
                    || booking.created_at > now - self.config.stale_pending()
                {
                    return Ok(None);
                }
                lifecycle::cancel(tx, &mut booking, STALE_REASON, now).await?;
            }
        }
        Ok(Some(booking))
    }

    fn notify(&self, booking: &Booking, step: Step) {
        let event = match step {
            Step::Activate => EventType::BookingStarted,
            Step::Complete => EventType::BookingCompleted,
            Step::CancelStale => EventType::BookingCancelled,
        };
        self.notifier.notify(Notification::new(
            booking.user_id,
            booking.booking_no.clone(),
            event,
            serde_json::json!({
                "room_id": booking.room_id,
                "status": booking.status,
            }),
        ));
    }
}
