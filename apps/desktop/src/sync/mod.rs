//! Sync engine for cloud synchronization.
//!
//! A cycle pushes the outbox oldest-first, then pulls every table from its
//! cursor. Either phase may fail without stopping the other; failures are
//! collected in the returned [`SyncReport`].

pub mod apply;
pub mod config;
pub mod error;
pub mod memory;
pub mod remote;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use repertoire_core::{AckOutcome, PullRequest, PullResponse, RemoteChange, SyncTable};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{OutboxEntry, OutboxRepository, SqliteRepository, SyncStateRepository};

pub use apply::{apply_remote_row, resolve_parked_conflict, ApplyOutcome, ManualChoice};
pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use memory::MemoryRemote;
pub use remote::{HttpRemote, RemoteStore};

/// Local store handle shared by the engine, workers and app commands.
pub type SharedRepository = Arc<Mutex<SqliteRepository>>;

/// Aggregated outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Outbox entries acknowledged by the remote.
    pub pushed: usize,
    /// Remote rows that changed the local store.
    pub pulled: usize,
    /// Outbox entries that failed this cycle.
    pub failed: usize,
    pub errors: Vec<String>,
    /// Entries parked after exhausting retries or being refused.
    pub stuck: usize,
    pub conflicts_parked: usize,
}

/// Sync status for UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SyncStatus {
    Idle,
    Syncing { stage: SyncStage },
    Completed { synced_at: DateTime<Utc>, report: SyncReport },
    Failed { error: String },
}

/// Current sync stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name")]
pub enum SyncStage {
    Pushing,
    Pulling { table: SyncTable },
}

/// Inner state shared across clones.
struct SyncEngineInner {
    repo: SharedRepository,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    status: Mutex<SyncStatus>,
    running: AtomicBool,
}

/// Clears the in-progress flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sync engine for one local store and one remote.
///
/// Cheap to clone; clones share state, including the in-progress flag.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

impl SyncEngine {
    /// Create an engine. Entries left in flight by an interrupted push are
    /// returned to the queue.
    pub fn new(repo: SharedRepository, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        {
            let store = repo.lock();
            if store.capture_installed() {
                match store.recover_inflight() {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "recovered in-flight outbox entries"),
                    Err(e) => warn!(error = %e, "failed to recover in-flight outbox entries"),
                }
            }
        }

        Self {
            inner: Arc::new(SyncEngineInner {
                repo,
                remote,
                config,
                status: Mutex::new(SyncStatus::Idle),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.lock().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &SharedRepository {
        &self.inner.repo
    }

    fn set_status(&self, status: SyncStatus) {
        *self.inner.status.lock() = status;
    }

    fn with_repo<T>(&self, f: impl FnOnce(&SqliteRepository) -> T) -> T {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Run one push-then-pull cycle.
    ///
    /// Returns [`SyncError::AlreadyInProgress`] if a cycle is already running.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::AlreadyInProgress);
        }
        let _running = RunningGuard(&self.inner.running);

        let mut report = SyncReport::default();

        self.set_status(SyncStatus::Syncing {
            stage: SyncStage::Pushing,
        });
        let floors = self.push(&mut report).await;
        self.pull(&mut report, &floors).await;

        let synced_at = self.with_repo(|repo| repo.now());
        if report.errors.is_empty() || report.pushed + report.pulled > 0 {
            self.set_status(SyncStatus::Completed {
                synced_at,
                report: report.clone(),
            });
        } else {
            self.set_status(SyncStatus::Failed {
                error: report.errors.join("; "),
            });
        }
        info!(
            pushed = report.pushed,
            pulled = report.pulled,
            failed = report.failed,
            errors = report.errors.len(),
            "sync cycle finished"
        );
        Ok(report)
    }

    async fn call_remote<T, F>(&self, call: F) -> SyncResult<T>
    where
        F: std::future::Future<Output = SyncResult<T>>,
    {
        match tokio::time::timeout(self.inner.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Record a failed attempt and schedule the retry, or park the entry.
    fn record_failure(
        &self,
        repo: &SqliteRepository,
        entry: &OutboxEntry,
        error: &str,
        retryable: bool,
        report: &mut SyncReport,
    ) {
        let retry = &self.inner.config.retry;
        let attempts = entry.attempts + 1;
        let retry_at = (retryable && !retry.exhausted(attempts)).then(|| {
            let delay = chrono::Duration::from_std(retry.delay_for_attempt(attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            repo.now() + delay
        });
        if retry_at.is_none() {
            warn!(
                table = %entry.table,
                record_id = %entry.record_id,
                attempts,
                error,
                "outbox entry stuck"
            );
        }
        if let Err(e) = repo.mark_attempt_failed(entry.id, error, retry_at) {
            report.errors.push(format!("outbox: {e}"));
        }
        report.failed += 1;
    }

    /// Push the outbox. Returns, per table, the lowest cursor from which a
    /// superseded record must be pulled again.
    async fn push(&self, report: &mut SyncReport) -> BTreeMap<SyncTable, i64> {
        let mut floors = BTreeMap::new();
        if !self.with_repo(|repo| repo.capture_installed()) {
            return floors;
        }
        let batch_size = self.inner.config.push_batch_size;

        loop {
            let batch = self.with_repo(|repo| repo.take_push_batch(batch_size, repo.now()));
            let batch = match batch {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => batch,
                Err(e) => {
                    report.errors.push(format!("push: {e}"));
                    break;
                }
            };
            let full = batch.len() == batch_size;

            let mut changes = Vec::with_capacity(batch.len());
            let mut sent = Vec::with_capacity(batch.len());
            for entry in batch {
                match entry.payload() {
                    Ok(payload) => {
                        changes.push(RemoteChange {
                            operation: entry.operation,
                            payload,
                        });
                        sent.push(entry);
                    }
                    Err(e) => self.with_repo(|repo| {
                        self.record_failure(repo, &entry, &e.to_string(), false, report)
                    }),
                }
            }
            if changes.is_empty() {
                if full {
                    continue;
                }
                break;
            }

            let result = self
                .call_remote(self.inner.remote.push_batch(&changes))
                .await
                .and_then(|acks| {
                    if acks.len() == sent.len() {
                        Ok(acks)
                    } else {
                        Err(SyncError::Protocol(format!(
                            "expected {} acks, got {}",
                            sent.len(),
                            acks.len()
                        )))
                    }
                });

            match result {
                Ok(acks) => self.with_repo(|repo| {
                    let mut synced = Vec::with_capacity(acks.len());
                    for (entry, ack) in sent.iter().zip(acks) {
                        match ack.outcome {
                            AckOutcome::Applied { .. } | AckOutcome::NotFound => {
                                synced.push(entry.id)
                            }
                            AckOutcome::Superseded { seq } => {
                                synced.push(entry.id);
                                let floor = floors.entry(entry.table).or_insert(seq - 1);
                                *floor = (*floor).min(seq - 1);
                            }
                            AckOutcome::Rejected { reason } => {
                                self.record_failure(repo, entry, &reason, false, report)
                            }
                        }
                    }
                    match repo.mark_synced(&synced, repo.now()) {
                        Ok(()) => report.pushed += synced.len(),
                        Err(e) => report.errors.push(format!("push: {e}")),
                    }
                    debug!(count = synced.len(), "push batch acknowledged");
                }),
                Err(e) => {
                    warn!(error = %e, "push failed");
                    let retryable = e.is_retryable();
                    let message = e.to_string();
                    self.with_repo(|repo| {
                        for entry in &sent {
                            self.record_failure(repo, entry, &message, retryable, report);
                        }
                    });
                    report.errors.push(format!("push: {message}"));
                    break;
                }
            }

            if !full {
                break;
            }
        }

        self.with_repo(|repo| {
            if let Err(e) = repo.prune_synced() {
                report.errors.push(format!("outbox: {e}"));
            }
            match repo.stuck_entries() {
                Ok(stuck) => report.stuck = stuck.len(),
                Err(e) => report.errors.push(format!("outbox: {e}")),
            }
        });
        floors
    }

    async fn pull(&self, report: &mut SyncReport, floors: &BTreeMap<SyncTable, i64>) {
        let limit = self.inner.config.pull_batch_size;
        for table in SyncTable::ALL {
            self.set_status(SyncStatus::Syncing {
                stage: SyncStage::Pulling { table },
            });
            let stored = match self.with_repo(|repo| repo.get_cursor(table)) {
                Ok(cursor) => cursor,
                Err(e) => {
                    report.errors.push(format!("pull {table}: {e}"));
                    continue;
                }
            };
            let mut cursor = floors
                .get(&table)
                .map_or(stored, |floor| stored.min(*floor))
                .max(0);

            loop {
                let request = PullRequest {
                    table,
                    cursor,
                    limit,
                };
                let response = match self.call_remote(self.inner.remote.pull_since(&request)).await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(%table, error = %e, "pull failed");
                        report.errors.push(format!("pull {table}: {e}"));
                        break;
                    }
                };
                if response.rows.is_empty() {
                    break;
                }

                let next = match self.apply_page(table, &response, report) {
                    Some(max_seq) if response.has_more && max_seq > cursor => max_seq,
                    _ => break,
                };
                cursor = next;
            }
        }
    }

    /// Apply one pull page. The cursor advances only if every row applied.
    fn apply_page(
        &self,
        table: SyncTable,
        response: &PullResponse,
        report: &mut SyncReport,
    ) -> Option<i64> {
        let strategy = self.inner.config.strategy;
        self.with_repo(|repo| {
            for row in &response.rows {
                if row.payload.table() != table {
                    report.errors.push(format!(
                        "pull {table}: remote returned a {} row",
                        row.payload.table()
                    ));
                    return None;
                }
                match apply_remote_row(repo, row, strategy) {
                    Ok(ApplyOutcome::Unchanged) => {}
                    Ok(outcome) => {
                        report.pulled += 1;
                        if outcome == ApplyOutcome::Parked {
                            report.conflicts_parked += 1;
                        }
                    }
                    Err(e) => {
                        warn!(%table, record_id = row.payload.record_id(), error = %e, "apply failed");
                        report.errors.push(format!("pull {table}: {e}"));
                        return None;
                    }
                }
            }

            let max_seq = response.max_seq?;
            match repo.set_cursor(table, max_seq, repo.now()) {
                Ok(()) => Some(max_seq),
                Err(e) => {
                    report.errors.push(format!("pull {table}: {e}"));
                    None
                }
            }
        })
    }

    // === Outbox administration ===

    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.with_repo(|repo| repo.pending_count())?)
    }

    pub fn stuck_entries(&self) -> SyncResult<Vec<OutboxEntry>> {
        Ok(self.with_repo(|repo| repo.stuck_entries())?)
    }

    /// Requeue stuck entries for the next cycle.
    pub fn retry_stuck(&self) -> SyncResult<usize> {
        let count = self.with_repo(|repo| repo.retry_stuck())?;
        if count > 0 {
            info!(count, "requeued stuck outbox entries");
        }
        Ok(count)
    }

    pub fn resolve_conflict(&self, conflict_id: i64, choice: ManualChoice) -> SyncResult<()> {
        self.with_repo(|repo| resolve_parked_conflict(repo, conflict_id, choice))
    }
}
