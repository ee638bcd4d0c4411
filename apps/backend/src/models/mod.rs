//! Database rows and API types

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

pub use repertoire_core::{
    AckOutcome, PullRequest, PullResponse, PushAck, PushRequest, PushResponse, RemoteChange,
    RemoteRow, SyncPayload, SyncTable,
};

/// A replicated row in PostgreSQL.
///
/// `data` is the full tagged payload; the metadata columns mirror its
/// sync fields for inspection and indexing.
#[derive(Debug, Clone, FromRow)]
pub struct DbSyncRow {
    pub table_name: String,
    pub record_id: String,
    pub data: Json<SyncPayload>,
    pub sync_version: i64,
    pub last_modified_at: DateTime<Utc>,
    pub device_id: Option<String>,
    pub deleted: bool,
    pub seq: i64,
}

impl DbSyncRow {
    pub fn into_remote_row(self) -> RemoteRow {
        RemoteRow {
            seq: self.seq,
            payload: self.data.0,
        }
    }
}

/// Stored row counts per table, served by `GET /api/sync/stats`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, FromRow)]
pub struct TableStats {
    pub table_name: String,
    pub rows: i64,
    pub deleted: i64,
    pub max_seq: i64,
}
