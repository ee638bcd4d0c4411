//! Periodic background workers.
//!
//! Each worker owns one job and one tokio task. Workers start and stop
//! independently; stopping runs the job one last time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::practice::FeedbackCache;
use crate::sync::{SharedRepository, SyncEngine, SyncError};

/// Work run on every tick of a [`Worker`].
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self);
}

pub struct Worker<J: Job> {
    job: Arc<J>,
    interval: Duration,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<J: Job> Worker<J> {
    pub fn new(job: J, interval: Duration) -> Self {
        Self {
            job: Arc::new(job),
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the worker loop. Returns `false` if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let job = Arc::clone(&self.job);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => job.run().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(worker = job.name(), "worker loop exited");
        });

        info!(worker = self.job.name(), interval_secs = period.as_secs(), "worker started");
        *running = Some((stop_tx, handle));
        true
    }

    /// Stop the loop and run the job once more.
    pub async fn stop(&self) {
        let Some((stop_tx, handle)) = self.running.lock().take() else {
            return;
        };
        let _ = stop_tx.send(true);
        if let Err(e) = handle.await {
            warn!(worker = self.job.name(), error = %e, "worker task ended abnormally");
        }
        self.job.run().await;
        info!(worker = self.job.name(), "worker stopped");
    }
}

/// Runs a sync cycle.
pub struct SyncJob {
    engine: SyncEngine,
}

impl SyncJob {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Job for SyncJob {
    fn name(&self) -> &'static str {
        "sync"
    }

    async fn run(&self) {
        match self.engine.sync().await {
            Ok(report) if !report.errors.is_empty() => {
                warn!(errors = report.errors.len(), "periodic sync finished with errors");
            }
            Ok(_) => {}
            Err(SyncError::AlreadyInProgress) => debug!("sync already running, tick skipped"),
            Err(e) => warn!(error = %e, "periodic sync failed"),
        }
    }
}

/// Writes staged review feedback to the local store.
pub struct FlushJob {
    cache: Arc<FeedbackCache>,
    repo: SharedRepository,
}

impl FlushJob {
    pub fn new(cache: Arc<FeedbackCache>, repo: SharedRepository) -> Self {
        Self { cache, repo }
    }
}

#[async_trait]
impl Job for FlushJob {
    fn name(&self) -> &'static str {
        "flush"
    }

    async fn run(&self) {
        if self.cache.staged_count() == 0 {
            return;
        }
        let report = {
            let repo = self.repo.lock();
            self.cache.flush(&repo)
        };
        if !report.errors.is_empty() {
            warn!(
                flushed = report.flushed,
                errors = report.errors.len(),
                "feedback flush finished with errors"
            );
        }
    }
}

pub type SyncWorker = Worker<SyncJob>;
pub type FlushWorker = Worker<FlushJob>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl Job for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_runs_once_more() {
        let worker = Worker::new(Counter::default(), Duration::from_secs(3600));
        assert!(worker.start());
        assert!(!worker.start());
        assert!(worker.is_running());

        worker.stop().await;
        assert!(!worker.is_running());
        assert_eq!(worker.job().0.load(Ordering::SeqCst), 1);

        // Stopping an idle worker does nothing.
        worker.stop().await;
        assert_eq!(worker.job().0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ticks_run_the_job() {
        let worker = Worker::new(Counter::default(), Duration::from_millis(10));
        worker.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        worker.stop().await;
        assert!(worker.job().0.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn workers_are_independent() {
        let a = Worker::new(Counter::default(), Duration::from_secs(3600));
        let b = Worker::new(Counter::default(), Duration::from_secs(3600));
        a.start();
        b.start();
        a.stop().await;
        assert!(!a.is_running());
        assert!(b.is_running());
        b.stop().await;
    }
}
