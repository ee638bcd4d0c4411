//! Remote store contract and its HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use repertoire_core::{
    Operation, PullRequest, PullResponse, PushAck, PushRequest, PushResponse, RemoteChange,
    SyncPayload,
};
use reqwest::Client;
use tracing::debug;

use super::error::{SyncError, SyncResult};

/// The cloud side of replication.
///
/// Writes are idempotent: replaying a change the remote already holds is
/// acknowledged without altering stored state.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert or update one record.
    async fn upsert(&self, payload: &SyncPayload) -> SyncResult<PushAck>;

    /// Mark a record deleted. `tombstone` carries the deleting replica's metadata.
    async fn soft_delete(&self, tombstone: &SyncPayload) -> SyncResult<PushAck>;

    /// Apply changes in order, one ack per change.
    async fn push_batch(&self, changes: &[RemoteChange]) -> SyncResult<Vec<PushAck>> {
        let mut acks = Vec::with_capacity(changes.len());
        for change in changes {
            let ack = match change.operation {
                Operation::Delete => self.soft_delete(&change.payload).await?,
                Operation::Insert | Operation::Update => self.upsert(&change.payload).await?,
            };
            acks.push(ack);
        }
        Ok(acks)
    }

    /// Rows of one table written after `request.cursor`, ascending by sequence.
    async fn pull_since(&self, request: &PullRequest) -> SyncResult<PullResponse>;
}

/// [`RemoteStore`] over the sync server's HTTP API.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    backend_url: String,
}

impl HttpRemote {
    pub fn new(backend_url: &str, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self {
            client,
            backend_url: backend_url.trim_end_matches('/').to_string(),
        })
    }

    /// Check if backend is reachable.
    pub async fn check_connectivity(&self) -> SyncResult<bool> {
        let url = format!("{}/health", self.backend_url);
        let resp = self.client.get(&url).send().await?;
        Ok(resp.status().is_success())
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> SyncResult<Resp>
    where
        Req: serde::Serialize + ?Sized,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.backend_url, path);
        let resp = self.client.post(&url).json(body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(SyncError::Backend { status, message });
        }

        resp.json()
            .await
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    async fn push_one(&self, operation: Operation, payload: &SyncPayload) -> SyncResult<PushAck> {
        let change = RemoteChange {
            operation,
            payload: payload.clone(),
        };
        self.push_batch(std::slice::from_ref(&change))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Protocol("push returned no ack".into()))
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn upsert(&self, payload: &SyncPayload) -> SyncResult<PushAck> {
        self.push_one(Operation::Update, payload).await
    }

    async fn soft_delete(&self, tombstone: &SyncPayload) -> SyncResult<PushAck> {
        self.push_one(Operation::Delete, tombstone).await
    }

    async fn push_batch(&self, changes: &[RemoteChange]) -> SyncResult<Vec<PushAck>> {
        let request = PushRequest {
            changes: changes.to_vec(),
        };
        let response: PushResponse = self.post("/api/sync/push", &request).await?;
        if response.acks.len() != changes.len() {
            return Err(SyncError::Protocol(format!(
                "expected {} acks, got {}",
                changes.len(),
                response.acks.len()
            )));
        }
        debug!(count = changes.len(), "pushed batch");
        Ok(response.acks)
    }

    async fn pull_since(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.post("/api/sync/pull", request).await
    }
}
