//! Sync endpoints

use axum::{extract::State, Json};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::*;
use crate::services::sync::{pull_limit, validate_pull, validate_push};
use crate::AppState;

/// POST /api/sync/push
/// Apply a batch of outbox changes, one ack per change
pub async fn push(
    State(state): State<AppState>,
    Json(payload): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    validate_push(&payload)?;
    let acks = state.db.push(&payload.changes).await?;

    let applied = acks
        .iter()
        .filter(|ack| matches!(ack.outcome, AckOutcome::Applied { .. }))
        .count();
    info!(changes = acks.len(), applied, "push applied");

    Ok(Json(PushResponse { acks }))
}

/// POST /api/sync/pull
/// Rows of one table written after the client's cursor
pub async fn pull(
    State(state): State<AppState>,
    Json(payload): Json<PullRequest>,
) -> Result<Json<PullResponse>> {
    validate_pull(&payload)?;
    let response = state
        .db
        .rows_since(payload.table, payload.cursor, pull_limit(&payload))
        .await?;

    debug!(
        table = payload.table.as_str(),
        cursor = payload.cursor,
        rows = response.rows.len(),
        has_more = response.has_more,
        "pull served"
    );
    Ok(Json(response))
}

/// GET /api/sync/stats
pub async fn stats(State(state): State<AppState>) -> Result<Json<Vec<TableStats>>> {
    Ok(Json(state.db.table_stats().await?))
}
