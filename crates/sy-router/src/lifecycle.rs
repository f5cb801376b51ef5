//! Lifecycle Manager - periodic housekeeping tasks
//!
//! Handles:
//! - Eviction sweeps for timeout maps, service pools and producer caches
//! - In-flight exchange reporting for the routing context
//! - Coordinated shutdown of every scheduled task

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A job run once per tick by the lifecycle manager.
#[async_trait]
pub trait Housekeeping: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self);
}

/// Runs housekeeping jobs on tokio intervals until shut down.
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    /// Create a new lifecycle manager without starting tasks
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Schedule `job` every `interval`, first run after one interval.
    pub fn schedule(&self, job: Arc<dyn Housekeeping>, interval: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(job = job.name(), "Running housekeeping");
                        job.run().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(job = job.name(), "Housekeeping task shutting down");
                        break;
                    }
                }
            }
        });

        self.handles.lock().push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Signal all tasks to stop and wait for them to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();

        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "Housekeeping task panicked");
                }
            }
        }

        if count > 0 {
            info!(tasks = count, "Lifecycle tasks stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Housekeeping for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn run(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let manager = LifecycleManager::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        manager.schedule(counter.clone(), Duration::from_millis(10));
        assert_eq!(manager.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.shutdown().await;
        let runs = counter.0.load(Ordering::SeqCst);
        assert!(runs >= 2, "ran {runs} times");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), runs);
        assert_eq!(manager.task_count(), 0);
    }
}
