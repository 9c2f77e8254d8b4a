//! Notifications
//!
//! `Notifier::notify` must never block the caller. `ChannelNotifier` pushes
//! onto a bounded channel drained by a dedicated consumer task; when the
//! channel is full the notification is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core_types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OrderCreated,
    OrderPaid,
    OrderCancelled,
    OrderExpired,
    OrderRefunded,
    OrderStatusChanged,
    WalletRecharged,
    BookingCreated,
    BookingPaid,
    BookingStarted,
    BookingCompleted,
    BookingCancelled,
    BookingRefunded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order_created",
            EventType::OrderPaid => "order_paid",
            EventType::OrderCancelled => "order_cancelled",
            EventType::OrderExpired => "order_expired",
            EventType::OrderRefunded => "order_refunded",
            EventType::OrderStatusChanged => "order_status_changed",
            EventType::WalletRecharged => "wallet_recharged",
            EventType::BookingCreated => "booking_created",
            EventType::BookingPaid => "booking_paid",
            EventType::BookingStarted => "booking_started",
            EventType::BookingCompleted => "booking_completed",
            EventType::BookingCancelled => "booking_cancelled",
            EventType::BookingRefunded => "booking_refunded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub user_id: UserId,
    /// Order or booking number.
    pub reference_no: String,
    pub event: EventType,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        reference_no: impl Into<String>,
        event: EventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            reference_no: reference_no.into(),
            event,
            payload,
        }
    }
}

/// Fire-and-forget delivery. Implementations may drop under backpressure.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Final destination of a notification (push service, websocket fan-out...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, n: Notification) -> anyhow::Result<()> {
        info!(
            user_id = n.user_id,
            reference_no = %n.reference_no,
            event = n.event.as_str(),
            payload = %n.payload,
            "Notification"
        );
        Ok(())
    }
}

pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ChannelNotifier {
    /// Create the notifier and spawn its consumer. The consumer exits once
    /// every `ChannelNotifier` clone of the sender is dropped.
    pub fn spawn(capacity: usize, sink: Arc<dyn NotificationSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                let event = n.event.as_str();
                let reference_no = n.reference_no.clone();
                if let Err(e) = sink.deliver(n).await {
                    warn!(event, reference_no = %reference_no, error = %e, "Notification delivery failed");
                }
            }
            debug!("Notification consumer stopped");
        });
        (
            Self {
                tx,
                sent: Arc::new(AtomicU64::new(0)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Notifications discarded because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let n = match e {
                    mpsc::error::TrySendError::Full(n) | mpsc::error::TrySendError::Closed(n) => n,
                };
                warn!(
                    event = n.event.as_str(),
                    reference_no = %n.reference_no,
                    dropped_total = total,
                    "Notification dropped"
                );
            }
        }
    }
}

/// Records every notification; for tests and embedding.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, event: EventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|n| n.event == event)
            .count()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) {}
}
