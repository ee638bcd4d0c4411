//! Request validation for the sync endpoints.

use crate::error::ApiError;
use crate::models::{PullRequest, PushRequest};

/// Rows returned per pull when the client asks for none.
pub const DEFAULT_PULL_LIMIT: i64 = 100;

/// Upper bound on rows returned per pull.
pub const MAX_PULL_LIMIT: i64 = 1000;

/// Upper bound on changes accepted per push.
pub const MAX_PUSH_BATCH: usize = 500;

/// Effective page size for a pull request.
pub fn pull_limit(request: &PullRequest) -> i64 {
    match i64::from(request.limit) {
        0 => DEFAULT_PULL_LIMIT,
        n => n.min(MAX_PULL_LIMIT),
    }
}

pub fn validate_pull(request: &PullRequest) -> Result<(), ApiError> {
    if request.cursor < 0 {
        return Err(ApiError::BadRequest(format!(
            "cursor must not be negative, got {}",
            request.cursor
        )));
    }
    Ok(())
}

/// Refuse batches the server will not hold a transaction open for.
///
/// Per-record problems are not errors here; they come back as `rejected`
/// acks so the rest of the batch still lands.
pub fn validate_push(request: &PushRequest) -> Result<(), ApiError> {
    if request.changes.len() > MAX_PUSH_BATCH {
        return Err(ApiError::BadRequest(format!(
            "push batch of {} exceeds the limit of {}",
            request.changes.len(),
            MAX_PUSH_BATCH
        )));
    }
    Ok(())
}
