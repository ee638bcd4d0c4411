//! Applying pulled rows to the local store.

use repertoire_core::{
    detect_conflict, resolve_conflict, Conflict, ConflictStrategy, RemoteRow, SyncPayload,
    SyncRecord, Winner,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::SyncResult;
use crate::db::{DbError, OutboxRepository, SqliteRepository, SyncStateRepository};

/// What happened to one pulled row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// Local copy already identical.
    Unchanged,
    /// Local copy won and was queued for push.
    KeptLocal,
    Merged,
    /// Stored for an explicit decision.
    Parked,
}

/// Explicit choice for a parked conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualChoice {
    KeepLocal,
    TakeRemote,
}

impl ManualChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::TakeRemote => "take_remote",
        }
    }
}

fn with_version(mut payload: SyncPayload, version: i64) -> SyncPayload {
    payload.sync_meta_mut().sync_version = version;
    payload
}

/// Overwrite the local row with the remote copy without capturing it.
fn take_remote(
    repo: &SqliteRepository,
    conn: &rusqlite::Connection,
    local: Option<&SyncPayload>,
    remote: &SyncPayload,
) -> Result<(), DbError> {
    let version = local
        .map_or(0, |l| l.sync_meta().sync_version)
        .max(remote.sync_meta().sync_version);
    repo.write_payload(conn, with_version(remote.clone(), version))?;
    repo.drop_unpushed(remote.table(), remote.record_id())?;
    Ok(())
}

/// Keep `winner` as a fresh local mutation so it is pushed again.
fn keep_local(
    repo: &SqliteRepository,
    conn: &rusqlite::Connection,
    winner: SyncPayload,
    remote: &SyncPayload,
) -> Result<(), DbError> {
    let version = winner
        .sync_meta()
        .sync_version
        .max(remote.sync_meta().sync_version);
    let mut base = with_version(winner, version);
    let meta = base.sync_meta_mut();
    meta.last_modified_at = meta
        .last_modified_at
        .max(remote.sync_meta().last_modified_at);
    // The re-push must be stamped after the remote copy or the cloud keeps its own.
    repo.write_payload(conn, base.clone())?;
    repo.save_payload(conn, base)?;
    Ok(())
}

/// Apply one remote row according to `strategy`.
pub fn apply_remote_row(
    repo: &SqliteRepository,
    row: &RemoteRow,
    strategy: ConflictStrategy,
) -> SyncResult<ApplyOutcome> {
    let remote = &row.payload;
    let table = remote.table();
    let record_id = remote.record_id();

    let tx = repo.conn.unchecked_transaction().map_err(DbError::from)?;
    let Some(local) = repo.load_payload(&tx, table, record_id)? else {
        repo.write_payload(&tx, remote.clone())?;
        tx.commit().map_err(DbError::from)?;
        return Ok(ApplyOutcome::Inserted);
    };

    // Without an unpushed local change the remote copy is a fast-forward
    // unless the local version is ahead of it.
    let unpushed = repo.has_unpushed(table, record_id)?;
    let behind = local.sync_meta().sync_version < remote.sync_meta().sync_version;
    if !unpushed && (behind || !detect_conflict(&local, remote)) {
        let outcome = if local == *remote {
            ApplyOutcome::Unchanged
        } else {
            repo.write_payload(&tx, remote.clone())?;
            ApplyOutcome::Updated
        };
        tx.commit().map_err(DbError::from)?;
        return Ok(outcome);
    }

    if strategy == ConflictStrategy::Manual {
        repo.park_conflict(&local, remote, row.seq, repo.now())?;
        tx.commit().map_err(DbError::from)?;
        info!(%table, record_id, "conflict parked for manual resolution");
        return Ok(ApplyOutcome::Parked);
    }

    let conflict = Conflict {
        local: local.clone(),
        remote: remote.clone(),
    };
    let resolution = resolve_conflict(&conflict, strategy)?;
    let outcome = match resolution.winner {
        Winner::Remote => {
            take_remote(repo, &tx, Some(&local), remote)?;
            ApplyOutcome::Updated
        }
        Winner::Local => {
            keep_local(repo, &tx, resolution.merged_data, remote)?;
            ApplyOutcome::KeptLocal
        }
        Winner::Merged => {
            keep_local(repo, &tx, resolution.merged_data, remote)?;
            ApplyOutcome::Merged
        }
    };
    tx.commit().map_err(DbError::from)?;
    debug!(%table, record_id, ?outcome, "resolved conflict");
    Ok(outcome)
}

/// Settle a parked conflict with an explicit choice.
pub fn resolve_parked_conflict(
    repo: &SqliteRepository,
    conflict_id: i64,
    choice: ManualChoice,
) -> SyncResult<()> {
    let parked = repo
        .get_conflict(conflict_id)?
        .ok_or_else(|| DbError::not_found("sync_conflict", conflict_id.to_string()))?;

    let tx = repo.conn.unchecked_transaction().map_err(DbError::from)?;
    let current = repo.load_payload(&tx, parked.table, &parked.record_id)?;
    match choice {
        ManualChoice::TakeRemote => {
            take_remote(repo, &tx, current.as_ref(), &parked.remote)?;
        }
        ManualChoice::KeepLocal => {
            let local = current.unwrap_or(parked.local);
            keep_local(repo, &tx, local, &parked.remote)?;
        }
    }
    repo.mark_conflict_resolved(conflict_id, choice.as_str(), repo.now())?;
    tx.commit().map_err(DbError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use repertoire_core::{SyncMeta, Tune};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn remote_tune(title: &str, version: i64, at: DateTime<Utc>) -> RemoteRow {
        RemoteRow {
            seq: 1,
            payload: SyncPayload::Tune(Tune {
                id: "t1".into(),
                title: title.into(),
                genre: None,
                sync: SyncMeta {
                    sync_version: version,
                    last_modified_at: at,
                    device_id: Some("other".into()),
                    deleted: false,
                },
            }),
        }
    }

    fn local_tune(repo: &SqliteRepository, title: &str) -> Tune {
        repo.save(Tune {
            id: "t1".into(),
            title: title.into(),
            genre: None,
            sync: SyncMeta::new(t0()),
        })
        .unwrap()
    }

    fn title(repo: &SqliteRepository) -> String {
        repo.get::<Tune>("t1").unwrap().unwrap().title
    }

    #[test]
    fn missing_row_is_inserted_uncaptured() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let row = remote_tune("Remote", 2, t0());
        assert_eq!(
            apply_remote_row(&repo, &row, ConflictStrategy::LastWriteWins).unwrap(),
            ApplyOutcome::Inserted
        );
        assert_eq!(title(&repo), "Remote");
        assert_eq!(repo.pending_count().unwrap(), 0);
    }

    #[test]
    fn newer_remote_wins_and_drops_local_change() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        local_tune(&repo, "Local");
        let row = remote_tune("Remote", 4, Utc::now() + Duration::hours(1));

        let outcome = apply_remote_row(&repo, &row, ConflictStrategy::LastWriteWins).unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
        assert_eq!(title(&repo), "Remote");
        assert_eq!(repo.pending_count().unwrap(), 0);
        assert_eq!(repo.get::<Tune>("t1").unwrap().unwrap().sync.sync_version, 4);
    }

    #[test]
    fn newer_local_is_kept_and_requeued() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        local_tune(&repo, "Local");
        let row = remote_tune("Remote", 7, t0() - Duration::days(1));

        let outcome = apply_remote_row(&repo, &row, ConflictStrategy::LastWriteWins).unwrap();
        assert_eq!(outcome, ApplyOutcome::KeptLocal);
        let stored = repo.get::<Tune>("t1").unwrap().unwrap();
        assert_eq!(stored.title, "Local");
        assert!(stored.sync.sync_version > 7);
        assert_eq!(repo.pending_count().unwrap(), 1);
    }

    #[test]
    fn kept_local_is_stamped_after_the_remote_copy() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        local_tune(&repo, "Local");
        let ahead = Utc::now() + Duration::hours(2);
        let row = remote_tune("Remote", 1, ahead);

        let outcome = apply_remote_row(&repo, &row, ConflictStrategy::LocalWins).unwrap();
        assert_eq!(outcome, ApplyOutcome::KeptLocal);
        let stored = repo.get::<Tune>("t1").unwrap().unwrap();
        assert_eq!(stored.title, "Local");
        assert!(stored.sync.last_modified_at > ahead);
    }

    #[test]
    fn manual_strategy_parks_and_later_resolves() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        local_tune(&repo, "Local");
        let row = remote_tune("Remote", 3, Utc::now() + Duration::hours(1));

        let outcome = apply_remote_row(&repo, &row, ConflictStrategy::Manual).unwrap();
        assert_eq!(outcome, ApplyOutcome::Parked);
        assert_eq!(title(&repo), "Local");

        let parked = repo.pending_conflicts().unwrap();
        assert_eq!(parked.len(), 1);
        resolve_parked_conflict(&repo, parked[0].id, ManualChoice::TakeRemote).unwrap();
        assert_eq!(title(&repo), "Remote");
        assert!(repo.pending_conflicts().unwrap().is_empty());
        assert_eq!(repo.pending_count().unwrap(), 0);
    }

    #[test]
    fn equal_version_without_local_change_applies_remote() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        local_tune(&repo, "Local");
        let entries = repo.take_push_batch(10, Utc::now()).unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        repo.mark_synced(&ids, Utc::now()).unwrap();

        let row = remote_tune("Remote", 1, t0() - Duration::days(1));
        let outcome = apply_remote_row(&repo, &row, ConflictStrategy::LocalWins).unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
        assert_eq!(title(&repo), "Remote");
    }
}
