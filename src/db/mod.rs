//! Database connection management
//!
//! The pool is sized from the CPU count; a periodic probe reports
//! utilization and the number of tasks waiting for a connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use crate::config::PoolConfig;

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
    config: PoolConfig,
    waiting: Arc<AtomicUsize>,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<Self, sqlx::Error> {
        let statement_timeout_ms = config.statement_timeout().as_millis() as u64;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open())
            // sqlx has no idle cap; max_idle is the floor of warm connections
            // and idle_timeout trims the rest.
            .min_connections(config.max_idle())
            .max_lifetime(config.max_lifetime())
            .idle_timeout(config.idle_timeout())
            .acquire_timeout(config.acquire_timeout())
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        info!(
            max_open = config.max_open(),
            max_idle = config.max_idle(),
            "PostgreSQL connection pool established"
        );
        Ok(Self {
            pool,
            config: config.clone(),
            waiting: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction, counted as a waiter until a connection is handed out.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let tx = self.pool.begin().await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        tx
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolStats::new(
            self.config.max_open(),
            size,
            idle,
            self.waiting.load(Ordering::Relaxed),
        )
    }

    /// One probe: ping, compute stats, warn above the configured thresholds.
    pub async fn probe(&self) -> PoolStats {
        if let Err(e) = self.health_check().await {
            warn!(error = %e, "Database health probe failed");
        }
        let stats = self.stats();
        for warning in stats.warnings(self.config.warn_utilization, self.config.warn_waiters) {
            warn!(
                in_use = stats.in_use,
                max_open = stats.max_open,
                waiting = stats.waiting,
                "{}",
                warning
            );
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub max_open: u32,
    pub open: u32,
    pub idle: u32,
    pub in_use: u32,
    pub waiting: usize,
    /// `in_use / max_open`, 0.0 ..= 1.0
    pub utilization: f64,
}

impl PoolStats {
    pub fn new(max_open: u32, open: u32, idle: u32, waiting: usize) -> Self {
        let in_use = open.saturating_sub(idle);
        let utilization = if max_open == 0 {
            0.0
        } else {
            f64::from(in_use) / f64::from(max_open)
        };
        Self {
            max_open,
            open,
            idle,
            in_use,
            waiting,
            utilization,
        }
    }

    pub fn warnings(&self, max_utilization: f64, max_waiters: usize) -> Vec<String> {
        let mut out = Vec::new();
        if self.utilization >= max_utilization {
            out.push(format!(
                "Connection pool utilization high: {:.0}%",
                self.utilization * 100.0
            ));
        }
        if self.waiting > max_waiters {
            out.push(format!("Connection wait queue long: {} waiting", self.waiting));
        }
        out
    }
}
