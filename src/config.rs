use std::fs;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::idempotency::Granularity;

fn cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL. Without it the in-memory store is used.
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Redis connection URL. Without it the in-memory key-value store is used.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Echo internal error details in API bodies (never in production).
    #[serde(default)]
    pub expose_error_detail: bool,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub order: OrderConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub booking: BookingConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "orderflow.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            postgres_url: None,
            redis_url: None,
            expose_error_detail: false,
            pool: PoolConfig::default(),
            order: OrderConfig::default(),
            expiry: ExpiryConfig::default(),
            booking: BookingConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

/// Connection pool sizing. Zero means "derive from CPU count".
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub max_open: u32,
    /// Connections kept open while idle (pool floor, clamped to `max_open`).
    pub max_idle: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub statement_timeout_secs: u64,
    pub health_interval_secs: u64,
    /// 0.0 ..= 1.0
    pub warn_utilization: f64,
    pub warn_waiters: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 0,
            max_idle: 0,
            max_lifetime_secs: 3600,
            idle_timeout_secs: 600,
            acquire_timeout_secs: 30,
            statement_timeout_secs: 30,
            health_interval_secs: 30,
            warn_utilization: 0.8,
            warn_waiters: 10,
        }
    }
}

impl PoolConfig {
    pub fn max_open(&self) -> u32 {
        if self.max_open > 0 { self.max_open } else { 4 * cpus() }
    }

    pub fn max_idle(&self) -> u32 {
        let idle = if self.max_idle > 0 { self.max_idle } else { 2 * cpus() };
        idle.min(self.max_open())
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OrderConfig {
    pub lock_ttl_secs: u64,
    /// Upper bound on waiting for the create/goods locks.
    pub lock_wait_secs: u64,
    /// Upper bound on waiting for payment/cancel locks.
    pub cancel_lock_wait_secs: u64,
    pub status_lock_ttl_secs: u64,
    pub expiry_ttl_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub idempotency_granularity: Granularity,
    pub conditional_retries: u32,
    pub retry_backoff_ms: u64,
    pub state_conflict_retries: u32,
    pub batch_budget_secs: u64,
    /// Proceed without the per-user/per-goods locks if the lock backend is down.
    pub degrade_without_locks: bool,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30,
            lock_wait_secs: 5,
            cancel_lock_wait_secs: 10,
            status_lock_ttl_secs: 10,
            expiry_ttl_secs: 15 * 60,
            idempotency_ttl_secs: 3600,
            idempotency_granularity: Granularity::Hour,
            conditional_retries: 3,
            retry_backoff_ms: 10,
            state_conflict_retries: 3,
            batch_budget_secs: 30,
            degrade_without_locks: true,
        }
    }
}

impl OrderConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn cancel_lock_wait(&self) -> Duration {
        Duration::from_secs(self.cancel_lock_wait_secs)
    }

    pub fn status_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.status_lock_ttl_secs)
    }

    pub fn expiry_ttl(&self) -> Duration {
        Duration::from_secs(self.expiry_ttl_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn batch_budget(&self) -> Duration {
        Duration::from_secs(self.batch_budget_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExpiryConfig {
    pub queue_poll_secs: u64,
    pub queue_batch: usize,
    pub requeue_delay_secs: u64,
    pub db_poll_secs: u64,
    pub db_batch: u32,
    /// Extra delay of the in-process timer past the order's expiry.
    pub timer_grace_secs: u64,
    pub restart_delay_secs: u64,
    pub enable_timers: bool,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            queue_poll_secs: 5,
            queue_batch: 10,
            requeue_delay_secs: 300,
            db_poll_secs: 120,
            db_batch: 50,
            timer_grace_secs: 120,
            restart_delay_secs: 5,
            enable_timers: true,
        }
    }
}

impl ExpiryConfig {
    pub fn queue_poll(&self) -> Duration {
        Duration::from_secs(self.queue_poll_secs)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }

    pub fn db_poll(&self) -> Duration {
        Duration::from_secs(self.db_poll_secs)
    }

    pub fn timer_grace(&self) -> Duration {
        Duration::from_secs(self.timer_grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BookingConfig {
    pub tick_secs: u64,
    pub stale_pending_secs: u64,
    pub batch: u32,
    pub lock_ttl_secs: u64,
    pub lock_wait_secs: u64,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            stale_pending_secs: 24 * 3600,
            batch: 100,
            lock_ttl_secs: 30,
            lock_wait_secs: 5,
        }
    }
}

impl BookingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn stale_pending(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_pending_secs as i64)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotifyConfig {
    pub channel_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
log_level: debug
log_dir: ./logs
log_file: test.log
use_json: true
rotation: hourly
"#;
        let cfg = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert!(cfg.postgres_url.is_none());
        assert_eq!(cfg.order.expiry_ttl(), Duration::from_secs(900));
        assert_eq!(cfg.order.idempotency_granularity, Granularity::Hour);
        assert_eq!(cfg.expiry.queue_batch, 10);
        assert_eq!(cfg.expiry.db_batch, 50);
        assert_eq!(cfg.booking.stale_pending(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_section_overrides() {
        let yaml = r#"
log_level: info
log_dir: ./logs
log_file: test.log
use_json: false
rotation: never
order:
  expiry_ttl_secs: 60
  idempotency_granularity: day
pool:
  max_open: 8
  max_idle: 16
"#;
        let cfg = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.order.expiry_ttl_secs, 60);
        assert_eq!(cfg.order.lock_ttl_secs, 30);
        assert_eq!(cfg.order.idempotency_granularity, Granularity::Day);
        assert_eq!(cfg.pool.max_open(), 8);
        // idle never exceeds open
        assert_eq!(cfg.pool.max_idle(), 8);
    }

    #[test]
    fn test_pool_derives_from_cpus() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.max_open(), 4 * cpus());
        assert_eq!(cfg.max_idle(), 2 * cpus());
        assert_eq!(cfg.max_lifetime(), Duration::from_secs(3600));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load("does-not-exist").is_err());
    }
}
