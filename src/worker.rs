//! Background worker plumbing: shutdown signal and panic-restarting spawn.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Sending half; dropping it also counts as shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was requested.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sleep for `period`. Returns `true` if shutdown arrived first.
pub async fn sleep_or_shutdown(shutdown: &mut Shutdown, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => shutdown.is_triggered(),
        _ = shutdown.wait() => true,
    }
}

/// Run `make(shutdown)` as a task; restart it after `restart_delay` when it
/// panics or returns before shutdown.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    restart_delay: Duration,
    shutdown: Shutdown,
    make: F,
) -> JoinHandle<()>
where
    F: Fn(Shutdown) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        info!(worker = name, "Worker started");
        loop {
            let run = tokio::spawn(make(shutdown.clone()));
            match run.await {
                Ok(()) if shutdown.is_triggered() => break,
                Ok(()) => warn!(worker = name, "Worker exited early, restarting"),
                Err(e) if e.is_panic() => error!(worker = name, "Worker panicked, restarting"),
                Err(_) => break,
            }
            if sleep_or_shutdown(&mut shutdown, restart_delay).await {
                break;
            }
        }
        info!(worker = name, "Worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_sleep_interrupted_by_shutdown() {
        let (trigger, mut shutdown) = shutdown_channel();
        let t = tokio::spawn(async move {
            sleep_or_shutdown(&mut shutdown, Duration::from_secs(60)).await
        });
        trigger.trigger();
        assert!(t.await.unwrap());
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let (_trigger, mut shutdown) = shutdown_channel();
        assert!(!sleep_or_shutdown(&mut shutdown, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_restarted() {
        let (trigger, shutdown) = shutdown_channel();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        let handle = spawn_supervised("flaky", Duration::from_millis(5), shutdown, move |mut sd| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
                sd.wait().await;
            }
        });

        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        trigger.trigger();
        handle.await.unwrap();
    }
}
