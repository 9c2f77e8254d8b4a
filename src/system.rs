//! Wiring of engines, schedulers and background workers.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::booking::{BookingScheduler, BookingService};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::{Database, PoolStats};
use crate::expiry::worker::{DbPoller, DbPollerConfig, QueueWorker, QueueWorkerConfig};
use crate::kv::KvStore;
use crate::lock::LockManager;
use crate::notify::Notifier;
use crate::order::{
    CompensationConfig, CompensationSweeper, EngineDeps, MerchantCounters, OrderEngine,
};
use crate::store::Store;
use crate::worker::{Shutdown, ShutdownTrigger, shutdown_channel, sleep_or_shutdown, spawn_supervised};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Key-value store down: locks degrade, expiry falls back to polling.
    Degraded,
    /// Relational store down.
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub backend: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: ComponentHealth,
    pub kv: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

pub struct OrderSystem {
    pub engine: Arc<OrderEngine>,
    pub bookings: Arc<BookingService>,
    pub scheduler: Arc<BookingScheduler>,
    pub compensation: Arc<CompensationSweeper>,
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    database: Option<Arc<Database>>,
    config: AppConfig,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderSystem {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        database: Option<Arc<Database>>,
    ) -> Self {
        let locks = Arc::new(LockManager::new(Arc::clone(&kv)));
        let engine = OrderEngine::new(
            EngineDeps {
                store: Arc::clone(&store),
                kv: Arc::clone(&kv),
                locks: Arc::clone(&locks),
                notifier: Arc::clone(&notifier),
                stats: Arc::new(MerchantCounters),
                clock: Arc::clone(&clock),
            },
            config.order.clone(),
            config.expiry.clone(),
        );
        let bookings = Arc::new(BookingService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.booking.clone(),
        ));
        let scheduler = Arc::new(BookingScheduler::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            notifier,
            Arc::clone(&clock),
            config.booking.clone(),
        ));
        let compensation = Arc::new(CompensationSweeper::new(
            Arc::clone(&store),
            locks,
            clock,
            CompensationConfig::default(),
        ));
        let (trigger, shutdown) = shutdown_channel();

        Self {
            engine,
            bookings,
            scheduler,
            compensation,
            store,
            kv,
            database,
            config,
            trigger,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn every background worker under supervision.
    pub fn start_workers(&self) {
        let restart = self.config.expiry.restart_delay();
        let mut handles = Vec::new();

        let queue = Arc::new(QueueWorker::new(
            Arc::clone(&self.engine),
            QueueWorkerConfig::from(&self.config.expiry),
        ));
        handles.push(spawn_supervised("expiry_queue", restart, self.shutdown.clone(), move |sd| {
            let queue = Arc::clone(&queue);
            async move { queue.run(sd).await }
        }));

        let poller = Arc::new(DbPoller::new(
            Arc::clone(&self.engine),
            DbPollerConfig::from_config(&self.config.expiry, &self.config.order),
        ));
        handles.push(spawn_supervised("expiry_poller", restart, self.shutdown.clone(), move |sd| {
            let poller = Arc::clone(&poller);
            async move { poller.run(sd).await }
        }));

        let scheduler = Arc::clone(&self.scheduler);
        handles.push(spawn_supervised("booking_scheduler", restart, self.shutdown.clone(), move |sd| {
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run(sd).await }
        }));

        let sweeper = Arc::clone(&self.compensation);
        handles.push(spawn_supervised("compensation", restart, self.shutdown.clone(), move |sd| {
            let sweeper = Arc::clone(&sweeper);
            async move { sweeper.run(sd).await }
        }));

        if let Some(db) = &self.database {
            let db = Arc::clone(db);
            let interval = self.config.pool.health_interval();
            handles.push(spawn_supervised("pool_probe", restart, self.shutdown.clone(), move |mut sd| {
                let db = Arc::clone(&db);
                async move {
                    while !sleep_or_shutdown(&mut sd, interval).await {
                        db.probe().await;
                    }
                }
            }));
        }

        info!(workers = handles.len(), "Background workers started");
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }

    pub async fn health(&self) -> HealthReport {
        let store = match self.store.ping().await {
            Ok(()) => ComponentHealth {
                backend: self.store.backend(),
                ok: true,
                error: None,
            },
            Err(e) => ComponentHealth {
                backend: self.store.backend(),
                ok: false,
                error: Some(e.to_string()),
            },
        };
        let kv = match self.kv.ping().await {
            Ok(()) => ComponentHealth {
                backend: self.kv.backend(),
                ok: true,
                error: None,
            },
            Err(e) => ComponentHealth {
                backend: self.kv.backend(),
                ok: false,
                error: Some(e.to_string()),
            },
        };
        let status = match (store.ok, kv.ok) {
            (false, _) => HealthStatus::Unhealthy,
            (true, false) => HealthStatus::Degraded,
            (true, true) => HealthStatus::Healthy,
        };
        if status != HealthStatus::Healthy {
            warn!(status = ?status, "Health check not healthy");
        }
        HealthReport {
            status,
            store,
            kv,
            pool: self.database.as_ref().map(|db| db.stats()),
        }
    }

    /// Signal workers, stop timers, wait for workers to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.trigger.trigger();
        self.engine.shutdown();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "Worker join failed");
            }
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::MemoryKv;
    use crate::notify::NoopNotifier;
    use crate::store::MemoryStore;

    fn system(store: &MemoryStore, kv: &Arc<MemoryKv>) -> OrderSystem {
        OrderSystem::new(
            AppConfig::default(),
            Arc::new(store.clone()),
            kv.clone(),
            Arc::new(NoopNotifier),
            Arc::new(SystemClock),
            None,
        )
    }

    #[tokio::test]
    async fn test_health_levels() {
        let store = MemoryStore::new();
        let kv = Arc::new(MemoryKv::new());
        let sys = system(&store, &kv);

        assert_eq!(sys.health().await.status, HealthStatus::Healthy);

        kv.set_available(false);
        let report = sys.health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.kv.error.is_some());

        store.set_available(false);
        assert_eq!(sys.health().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let store = MemoryStore::new();
        let kv = Arc::new(MemoryKv::new());
        let sys = system(&store, &kv);
        sys.start_workers();
        tokio::time::timeout(std::time::Duration::from_secs(5), sys.shutdown())
            .await
            .unwrap();
    }
}
