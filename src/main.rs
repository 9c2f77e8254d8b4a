//! orderflow service entry point
//!
//! ```text
//! config ──▶ stores (PostgreSQL | memory, Redis | memory)
//!        ──▶ OrderSystem (order engine, booking service)
//!        ──▶ workers (expiry queue, expiry poller, booking tick,
//!                     compensation, pool probe)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use orderflow::clock::SystemClock;
use orderflow::config::AppConfig;
use orderflow::db::Database;
use orderflow::kv::{KvStore, MemoryKv, RedisKv};
use orderflow::notify::{ChannelNotifier, LogSink};
use orderflow::store::{MemoryStore, PgStore, Store};
use orderflow::system::OrderSystem;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn migrate_only() -> bool {
    std::env::args().any(|a| a == "--migrate")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = orderflow::logging::init_logging(&app_config);
    info!(env = %env, "orderflow starting");

    let (store, database): (Arc<dyn Store>, Option<Arc<Database>>) = match &app_config.postgres_url {
        Some(url) => {
            let db = Arc::new(
                Database::connect(url, &app_config.pool)
                    .await
                    .context("Failed to connect to PostgreSQL")?,
            );
            let pg = PgStore::new(Arc::clone(&db));
            pg.migrate().await.context("Schema migration failed")?;
            (Arc::new(pg), Some(db))
        }
        None => {
            warn!("No postgres_url configured, using the in-memory store");
            (Arc::new(MemoryStore::new()), None)
        }
    };
    if migrate_only() {
        info!("Migration finished");
        return Ok(());
    }

    let kv: Arc<dyn KvStore> = match &app_config.redis_url {
        Some(url) => Arc::new(
            RedisKv::connect(url)
                .await
                .context("Failed to connect to Redis")?,
        ),
        None => {
            warn!("No redis_url configured, using the in-memory key-value store");
            Arc::new(MemoryKv::new())
        }
    };

    let (notifier, notify_task) =
        ChannelNotifier::spawn(app_config.notify.channel_capacity, Arc::new(LogSink));
    let notifier = Arc::new(notifier);

    let system = OrderSystem::new(
        app_config,
        store,
        kv,
        notifier.clone(),
        Arc::new(SystemClock),
        database,
    );
    system.start_workers();
    let health = system.health().await;
    info!(status = ?health.status, store = health.store.backend, kv = health.kv.backend, "Ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    system.shutdown().await;

    info!(
        sent = notifier.sent(),
        dropped = notifier.dropped(),
        "Notifications"
    );
    // The consumer drains what is queued once the last sender is gone.
    drop(system);
    drop(notifier);
    if tokio::time::timeout(Duration::from_secs(2), notify_task)
        .await
        .is_err()
    {
        warn!("Notification queue not drained before exit");
    }
    Ok(())
}
