//! Sync errors.

use repertoire_core::ConflictError;
use thiserror::Error;

use crate::db::DbError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("remote call timed out")]
    Timeout,

    #[error("backend error: {status} - {message}")]
    Backend { status: u16, message: String },

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("sync already in progress")]
    AlreadyInProgress,

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a later attempt may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout => true,
            Self::Backend { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Protocol(e.to_string())
        } else if e.is_connect() || e.is_request() {
            Self::transport_retryable(e.to_string())
        } else {
            Self::transport_fatal(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Backend {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!SyncError::Backend {
            status: 422,
            message: "bad payload".into()
        }
        .is_retryable());
        assert!(!SyncError::AlreadyInProgress.is_retryable());
        assert!(!SyncError::Protocol("garbled".into()).is_retryable());
    }
}
