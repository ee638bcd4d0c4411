//! In-process remote store.
//!
//! Holds rows in memory with a server-assigned sequence, so several local
//! engines can replicate through one instance. Failure and latency can be
//! injected for tests and offline demos.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use repertoire_core::{
    plan_remote_write, AckOutcome, Operation, PullRequest, PullResponse, PushAck, RemoteChange,
    RemoteRow, RemoteWrite, SyncPayload, SyncTable,
};

use super::error::{SyncError, SyncResult};
use super::remote::RemoteStore;

#[derive(Debug, Default)]
struct MemoryState {
    seq: i64,
    rows: BTreeMap<(SyncTable, String), RemoteRow>,
    offline: bool,
    fail_next_pushes: u32,
    rejected: HashSet<String>,
    push_calls: usize,
}

impl MemoryState {
    fn store(&mut self, payload: SyncPayload) -> i64 {
        self.seq += 1;
        let key = (payload.table(), payload.record_id().to_string());
        self.rows.insert(
            key,
            RemoteRow {
                seq: self.seq,
                payload,
            },
        );
        self.seq
    }

    fn apply(&mut self, operation: Operation, payload: &SyncPayload) -> PushAck {
        let table = payload.table();
        let record_id = payload.record_id().to_string();
        let ack = |outcome| PushAck {
            table,
            record_id: record_id.clone(),
            outcome,
        };

        if self.rejected.contains(&record_id) {
            return ack(AckOutcome::Rejected {
                reason: format!("record {record_id} refused by remote"),
            });
        }

        let change = RemoteChange {
            operation,
            payload: payload.clone(),
        };
        let write = plan_remote_write(self.rows.get(&(table, record_id.clone())), &change);
        match write {
            RemoteWrite::Ack(outcome) => ack(outcome),
            RemoteWrite::Store(stored) => {
                let seq = self.store(stored);
                ack(AckOutcome::Applied { seq })
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    latency: Mutex<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a retryable transport error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fail the next `count` push calls.
    pub fn fail_next_pushes(&self, count: u32) {
        self.state.lock().fail_next_pushes = count;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Refuse writes to `record_id` permanently.
    pub fn reject_record(&self, record_id: impl Into<String>) {
        self.state.lock().rejected.insert(record_id.into());
    }

    /// Store a row as if another writer had pushed it. Returns its sequence.
    pub fn seed(&self, payload: SyncPayload) -> i64 {
        self.state.lock().store(payload)
    }

    pub fn get(&self, table: SyncTable, record_id: &str) -> Option<SyncPayload> {
        self.state
            .lock()
            .rows
            .get(&(table, record_id.to_string()))
            .map(|row| row.payload.clone())
    }

    pub fn rows(&self, table: SyncTable) -> Vec<RemoteRow> {
        let mut rows: Vec<RemoteRow> = self
            .state
            .lock()
            .rows
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by_key(|row| row.seq);
        rows
    }

    pub fn push_calls(&self) -> usize {
        self.state.lock().push_calls
    }

    pub fn current_seq(&self) -> i64 {
        self.state.lock().seq
    }

    async fn enter(&self, push: bool) -> SyncResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if push {
            state.push_calls += 1;
        }
        if state.offline {
            return Err(SyncError::transport_retryable("remote unreachable"));
        }
        if push && state.fail_next_pushes > 0 {
            state.fail_next_pushes -= 1;
            return Err(SyncError::transport_retryable("connection reset during push"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(&self, payload: &SyncPayload) -> SyncResult<PushAck> {
        self.enter(true).await?;
        Ok(self.state.lock().apply(Operation::Update, payload))
    }

    async fn soft_delete(&self, tombstone: &SyncPayload) -> SyncResult<PushAck> {
        self.enter(true).await?;
        Ok(self.state.lock().apply(Operation::Delete, tombstone))
    }

    async fn push_batch(&self, changes: &[RemoteChange]) -> SyncResult<Vec<PushAck>> {
        self.enter(true).await?;
        let mut state = self.state.lock();
        Ok(changes
            .iter()
            .map(|change| state.apply(change.operation, &change.payload))
            .collect())
    }

    async fn pull_since(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.enter(false).await?;
        let mut newer: Vec<RemoteRow> = self
            .rows(request.table)
            .into_iter()
            .filter(|row| row.seq > request.cursor)
            .collect();
        let limit = request.limit.max(1) as usize;
        let has_more = newer.len() > limit;
        newer.truncate(limit);
        Ok(PullResponse::new(newer, has_more))
    }
}
