//! Expiry Workers
//!
//! Queue consumer (sorted set) and database poller. Both funnel into
//! `OrderEngine::cancel_expired_order`, which is idempotent.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::{ExpiryConfig, OrderConfig};
use crate::error::{EngineError, EngineResult};
use crate::order::engine::{CancelOutcome, OrderEngine, log_cancel_result};
use crate::worker::{Shutdown, sleep_or_shutdown};

/// Lock contention: try again later instead of dropping the entry.
fn should_requeue(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::SystemBusy(_)
            | EngineError::AlreadyHeld(_)
            | EngineError::LockBackendUnavailable(_)
            | EngineError::OptimisticConflict(_)
    )
}

#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub requeue_delay: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            requeue_delay: Duration::from_secs(300),
        }
    }
}

impl From<&ExpiryConfig> for QueueWorkerConfig {
    fn from(c: &ExpiryConfig) -> Self {
        Self {
            poll_interval: c.queue_poll(),
            batch_size: c.queue_batch,
            requeue_delay: c.requeue_delay(),
        }
    }
}

/// Consumes `order_timeouts`. Several instances may run; `claim_due` hands
/// each entry to exactly one of them.
pub struct QueueWorker {
    engine: Arc<OrderEngine>,
    config: QueueWorkerConfig,
}

impl QueueWorker {
    pub fn new(engine: Arc<OrderEngine>, config: QueueWorkerConfig) -> Self {
        Self { engine, config }
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting expiry queue worker"
        );
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Expiry queue poll failed");
            }
            if sleep_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                break;
            }
        }
    }

    /// One poll. Returns how many orders were cancelled.
    pub async fn tick(&self) -> EngineResult<usize> {
        let now = self.engine.clock().now();
        let claimed = self
            .engine
            .expiry_queue()
            .claim_due(now, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(count = claimed.len(), "Claimed due orders");

        let mut cancelled = 0;
        for order_no in &claimed {
            let result = self.engine.cancel_expired_order(order_no).await;
            log_cancel_result(order_no, "queue", &result);
            match result {
                Ok(CancelOutcome::Cancelled) => cancelled += 1,
                Ok(_) => {}
                Err(e) if should_requeue(&e) => self.requeue(order_no).await,
                Err(_) => {}
            }
        }
        Ok(cancelled)
    }

    async fn requeue(&self, order_no: &str) {
        let delay = chrono::Duration::from_std(self.config.requeue_delay)
            .unwrap_or(chrono::Duration::minutes(5));
        let due = self.engine.clock().now() + delay;
        match self.engine.expiry_queue().schedule(order_no, due).await {
            Ok(()) => info!(order_no = %order_no, due = %due, "Expiry re-enqueued"),
            Err(e) => error!(order_no = %order_no, error = %e, "Expiry re-enqueue failed, poller will retry"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbPollerConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Age after which a pending order is overdue.
    pub order_ttl: Duration,
}

impl Default for DbPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(120),
            batch_size: 50,
            order_ttl: Duration::from_secs(900),
        }
    }
}

impl DbPollerConfig {
    pub fn from_config(expiry: &ExpiryConfig, order: &OrderConfig) -> Self {
        Self {
            poll_interval: expiry.db_poll(),
            batch_size: expiry.db_batch,
            order_ttl: order.expiry_ttl(),
        }
    }
}

/// Finds overdue pending orders in the relational store, whatever happened
/// to their queue entries.
pub struct DbPoller {
    engine: Arc<OrderEngine>,
    config: DbPollerConfig,
}

impl DbPoller {
    pub fn new(engine: Arc<OrderEngine>, config: DbPollerConfig) -> Self {
        Self { engine, config }
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting expiry database poller"
        );
        loop {
            if sleep_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                break;
            }
            if let Err(e) = self.scan_and_cancel().await {
                error!(error = %e, "Expiry database scan failed");
            }
        }
    }

    /// One scan; cancellations run concurrently. Returns how many were cancelled.
    pub async fn scan_and_cancel(&self) -> EngineResult<usize> {
        let ttl = chrono::Duration::from_std(self.config.order_ttl)
            .unwrap_or(chrono::Duration::minutes(15));
        let cutoff = self.engine.clock().now() - ttl;
        let overdue = self
            .engine
            .store()
            .expired_pending_orders(cutoff, self.config.batch_size)
            .await?;
        if overdue.is_empty() {
            debug!("No overdue pending orders");
            return Ok(0);
        }
        info!(count = overdue.len(), "Found overdue pending orders");

        let results = join_all(overdue.iter().map(|no| self.engine.cancel_expired_order(no))).await;
        let mut cancelled = 0;
        for (order_no, result) in overdue.iter().zip(results.iter()) {
            log_cancel_result(order_no, "poller", result);
            if matches!(result, Ok(CancelOutcome::Cancelled)) {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}
