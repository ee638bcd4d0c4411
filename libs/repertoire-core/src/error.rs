//! Error types for repertoire-core.

use thiserror::Error;

use crate::sync::SyncTable;

/// Errors raised by the scheduler on malformed input.
#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid rating: quality {quality} does not map to Again/Hard/Good/Easy")]
    InvalidRating { quality: u8 },

    #[error("invalid scheduler parameters: {0}")]
    InvalidParameters(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Errors raised while resolving a sync conflict.
#[derive(Debug, Error, PartialEq)]
pub enum ConflictError {
    #[error("manual resolution required for {table} record {record_id}")]
    ManualResolutionRequired { table: SyncTable, record_id: String },

    #[error("cannot resolve records from different tables: {local} vs {remote}")]
    TableMismatch { local: SyncTable, remote: SyncTable },

    #[error("field merge failed: {0}")]
    Merge(String),
}

/// Errors raised when a serialized payload fails schema validation.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload does not match schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("payload is for table {actual}, expected {expected}")]
    WrongTable { expected: SyncTable, actual: SyncTable },

    #[error("unknown sync table: {0}")]
    UnknownTable(String),
}
