//! App-facing commands.
//!
//! Thin wrappers over the local store and the sync engine that take the
//! shared [`AppState`] and return serializable results. Store locks are
//! never held across an `.await`.

use chrono::{DateTime, Utc};
use repertoire_core::{CardState, PracticeRecord};
use serde::Serialize;

use crate::db::{DbError, OutboxEntry, OutboxRepository, ParkedConflict, PracticeListRow, SyncStateRepository};
use crate::practice::{self, AddTunesResult, FlushReport, QueueKey, SubmitReview};
use crate::state::AppState;
use crate::sync::{resolve_parked_conflict, ManualChoice, SyncError, SyncEngine, SyncReport, SyncStatus};

/// Command error type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandError {
    pub message: String,
}

impl CommandError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn database(e: impl std::fmt::Display) -> Self {
        Self::new(format!("Database error: {}", e))
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CommandError {}

impl From<DbError> for CommandError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Validation(message) => Self::new(message),
            DbError::Schedule(e) => Self::new(e.to_string()),
            other => Self::database(other),
        }
    }
}

impl From<SyncError> for CommandError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Database(e) => e.into(),
            other => Self::new(other.to_string()),
        }
    }
}

type CommandResult<T> = Result<T, CommandError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewResponse {
    pub new_state: CardState,
    pub next_due: DateTime<Utc>,
    pub interval: i64,
}

impl From<PracticeRecord> for ReviewResponse {
    fn from(record: PracticeRecord) -> Self {
        Self {
            new_state: record.state,
            next_due: record.due,
            interval: record.interval,
        }
    }
}

/// Local sync bookkeeping for a status panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalSyncState {
    pub device_id: String,
    pub capture_active: bool,
    pub pending: usize,
    pub stuck: usize,
    pub conflicts: usize,
    pub staged_reviews: usize,
}

fn engine(state: &AppState) -> CommandResult<SyncEngine> {
    state
        .engine
        .clone()
        .ok_or_else(|| CommandError::new("Sync is not configured"))
}

// === Practice ===

pub fn get_practice_list(
    state: &AppState,
    user_ref: &str,
    repertoire_ref: &str,
    window_start: Option<DateTime<Utc>>,
) -> CommandResult<Vec<PracticeListRow>> {
    let repo = state.repository.lock();
    Ok(practice::get_practice_list(&repo, user_ref, repertoire_ref, window_start)?)
}

pub fn add_tunes_to_queue(
    state: &AppState,
    repertoire_ref: &str,
    tune_ids: &[String],
) -> CommandResult<AddTunesResult> {
    let repo = state.repository.lock();
    Ok(practice::add_tunes_to_queue(&repo, repertoire_ref, tune_ids)?)
}

/// Record a review immediately.
pub fn submit_review(state: &AppState, review: SubmitReview) -> CommandResult<ReviewResponse> {
    let repo = state.repository.lock();
    Ok(practice::submit_review(&repo, &review)?.into())
}

/// Stage a review for the next feedback flush.
pub fn stage_review(state: &AppState, review: SubmitReview) -> CommandResult<QueueKey> {
    Ok(state.feedback.stage(review)?)
}

pub fn flush_feedback(state: &AppState) -> FlushReport {
    let repo = state.repository.lock();
    state.feedback.flush(&repo)
}

pub fn purge_deselected_genres(state: &AppState, keep: &[String]) -> CommandResult<usize> {
    let repo = state.repository.lock();
    Ok(repo.purge_deselected_genres(keep)?)
}

// === Sync ===

/// Run a sync cycle now.
pub async fn start_sync(state: &AppState) -> CommandResult<SyncReport> {
    let engine = engine(state)?;
    Ok(engine.sync().await?)
}

pub fn get_sync_status(state: &AppState) -> SyncStatus {
    state
        .engine
        .as_ref()
        .map(SyncEngine::status)
        .unwrap_or(SyncStatus::Idle)
}

pub fn get_local_sync_state(state: &AppState) -> CommandResult<LocalSyncState> {
    let repo = state.repository.lock();
    Ok(LocalSyncState {
        device_id: repo.device_id().to_string(),
        capture_active: repo.capture_active(),
        pending: repo.pending_count()?,
        stuck: repo.stuck_entries()?.len(),
        conflicts: repo.pending_conflicts()?.len(),
        staged_reviews: state.feedback.staged_count(),
    })
}

pub fn list_stuck_entries(state: &AppState) -> CommandResult<Vec<OutboxEntry>> {
    let repo = state.repository.lock();
    Ok(repo.stuck_entries()?)
}

pub fn retry_stuck(state: &AppState) -> CommandResult<usize> {
    let repo = state.repository.lock();
    Ok(repo.retry_stuck()?)
}

pub fn list_conflicts(state: &AppState) -> CommandResult<Vec<ParkedConflict>> {
    let repo = state.repository.lock();
    Ok(repo.pending_conflicts()?)
}

pub fn resolve_conflict(
    state: &AppState,
    conflict_id: i64,
    choice: ManualChoice,
) -> CommandResult<()> {
    let repo = state.repository.lock();
    Ok(resolve_parked_conflict(&repo, conflict_id, choice)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteRepository;
    use crate::sync::{MemoryRemote, SyncConfig};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use repertoire_core::{Goal, RepertoireTune, SyncMeta};
    use std::sync::Arc;

    fn state() -> AppState {
        let state = AppState::new(SqliteRepository::open_in_memory().unwrap());
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        state
            .repository
            .lock()
            .save(RepertoireTune {
                id: "rt1".into(),
                repertoire_ref: "r1".into(),
                tune_ref: "t1".into(),
                scheduled: None,
                added_at: at,
                sync: SyncMeta::new(at),
            })
            .unwrap();
        state
    }

    fn review(quality: u8) -> SubmitReview {
        SubmitReview {
            user_ref: "u1".into(),
            repertoire_ref: "r1".into(),
            tune_ref: "t1".into(),
            quality,
            practiced: Utc::now(),
            goal: Goal::Recall,
            technique: None,
        }
    }

    #[test]
    fn validation_errors_keep_their_message() {
        let state = state();
        let mut input = review(3);
        input.tune_ref = "nope".into();
        let err = submit_review(&state, input).unwrap_err();
        assert_eq!(err.message, "tune nope is not in repertoire r1");
    }

    #[test]
    fn staged_reviews_show_up_in_local_state() {
        let state = state();
        stage_review(&state, review(3)).unwrap();
        let local = get_local_sync_state(&state).unwrap();
        assert_eq!(local.staged_reviews, 1);
        assert!(local.pending >= 1);

        assert_eq!(flush_feedback(&state).flushed, 1);
        assert_eq!(get_local_sync_state(&state).unwrap().staged_reviews, 0);
    }

    #[tokio::test]
    async fn sync_requires_a_remote() {
        let state = state();
        assert_eq!(get_sync_status(&state), SyncStatus::Idle);
        assert!(start_sync(&state).await.is_err());

        let state = state.with_remote(Arc::new(MemoryRemote::new()), SyncConfig::default());
        let report = start_sync(&state).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(get_local_sync_state(&state).unwrap().pending, 0);
    }
}
