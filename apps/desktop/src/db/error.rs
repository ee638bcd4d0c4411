//! Database error types.

use repertoire_core::{PayloadError, ScheduleError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("{table} not found: {id}")]
    NotFound { table: &'static str, id: String },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl DbError {
    pub fn not_found(table: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            table,
            id: id.into(),
        }
    }
}
