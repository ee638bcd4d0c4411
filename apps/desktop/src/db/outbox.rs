//! Outbox, pull cursors and parked conflicts.

use chrono::{DateTime, Utc};
use repertoire_core::{Operation, OutboxStatus, PayloadError, SyncPayload, SyncTable};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::date_utils::{self, to_sql};
use super::error::DbError;
use super::repository::{Result, SqliteRepository};

/// A captured local mutation awaiting push.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub table: SyncTable,
    pub record_id: String,
    pub operation: Operation,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn payload(&self) -> std::result::Result<SyncPayload, PayloadError> {
        SyncPayload::from_json(self.table, &self.data)
    }
}

/// A remote change that could not be applied without a human decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParkedConflict {
    pub id: i64,
    pub table: SyncTable,
    pub record_id: String,
    pub local: SyncPayload,
    pub remote: SyncPayload,
    pub remote_seq: i64,
    pub detected_at: DateTime<Utc>,
}

const OUTBOX_COLUMNS: &str = "id, table_name, record_id, operation, data, created_at, status, \
                              attempts, last_error, next_retry_at, synced_at";

fn invalid_text(idx: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, what.into())
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let table: String = row.get(1)?;
    let operation: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(OutboxEntry {
        id: row.get(0)?,
        table: SyncTable::parse(&table).map_err(|e| invalid_text(1, e.to_string()))?,
        record_id: row.get(2)?,
        operation: Operation::parse(&operation)
            .ok_or_else(|| invalid_text(3, format!("unknown operation {operation}")))?,
        data: row.get(4)?,
        created_at: date_utils::get(row, 5)?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| invalid_text(6, format!("unknown status {status}")))?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        next_retry_at: date_utils::get_opt(row, 9)?,
        synced_at: date_utils::get_opt(row, 10)?,
    })
}

/// Append a mutation, folding it into a still-pending entry for the same
/// record so one push carries the latest state.
pub(crate) fn enqueue(
    conn: &Connection,
    operation: Operation,
    payload: &SyncPayload,
    now: DateTime<Utc>,
) -> Result<()> {
    let data = payload.to_json()?;
    let table = payload.table().as_str();
    let record_id = payload.record_id();

    let pending: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, operation FROM sync_outbox
             WHERE table_name = ?1 AND record_id = ?2 AND status = 'pending'
             ORDER BY id DESC LIMIT 1",
            params![table, record_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match pending {
        Some((id, previous)) => {
            let previous = Operation::parse(&previous)
                .ok_or_else(|| DbError::InvalidData(format!("unknown operation {previous}")))?;
            conn.execute(
                "UPDATE sync_outbox SET operation = ?1, data = ?2 WHERE id = ?3",
                params![previous.coalesce(operation).as_str(), data, id],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO sync_outbox (table_name, record_id, operation, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![table, record_id, operation.as_str(), data, to_sql(now)],
            )?;
        }
    }
    Ok(())
}

/// Repository for the outbox queue.
pub trait OutboxRepository {
    /// Claim up to `limit` due entries in capture order, marking them in flight.
    fn take_push_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>>;
    fn mark_synced(&self, ids: &[i64], now: DateTime<Utc>) -> Result<()>;
    /// Record a failed attempt. `retry_at` of `None` parks the entry as failed.
    fn mark_attempt_failed(
        &self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<u32>;
    fn get_outbox_entry(&self, id: i64) -> Result<Option<OutboxEntry>>;
    fn pending_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>>;
    /// Entries not yet acknowledged by the remote.
    fn pending_count(&self) -> Result<usize>;
    fn stuck_entries(&self) -> Result<Vec<OutboxEntry>>;
    /// Put failed entries back in the queue with a fresh attempt budget.
    fn retry_stuck(&self) -> Result<usize>;
    /// Return entries left in flight by an interrupted push.
    fn recover_inflight(&self) -> Result<usize>;
    fn prune_synced(&self) -> Result<usize>;
    fn has_unpushed(&self, table: SyncTable, record_id: &str) -> Result<bool>;
    /// Discard unpushed entries for a record whose remote copy won.
    fn drop_unpushed(&self, table: SyncTable, record_id: &str) -> Result<usize>;
}

/// Repository for pull cursors and parked conflicts.
pub trait SyncStateRepository {
    fn get_cursor(&self, table: SyncTable) -> Result<i64>;
    fn set_cursor(&self, table: SyncTable, cursor: i64, now: DateTime<Utc>) -> Result<()>;
    fn park_conflict(
        &self,
        local: &SyncPayload,
        remote: &SyncPayload,
        remote_seq: i64,
        now: DateTime<Utc>,
    ) -> Result<i64>;
    fn pending_conflicts(&self) -> Result<Vec<ParkedConflict>>;
    fn get_conflict(&self, id: i64) -> Result<Option<ParkedConflict>>;
    fn mark_conflict_resolved(&self, id: i64, resolution: &str, now: DateTime<Utc>)
        -> Result<()>;
}

impl OutboxRepository for SqliteRepository {
    fn take_push_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        let tx = self.conn.unchecked_transaction()?;
        let entries = {
            let sql = format!(
                "SELECT {OUTBOX_COLUMNS} FROM sync_outbox
                 WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                 ORDER BY created_at, id LIMIT ?2"
            );
            let mut stmt = tx.prepare(&sql)?;
            let entries = stmt
                .query_map(params![to_sql(now), limit as i64], read_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            entries
        };
        for entry in &entries {
            tx.execute(
                "UPDATE sync_outbox SET status = 'syncing' WHERE id = ?1",
                [entry.id],
            )?;
        }
        tx.commit()?;

        Ok(entries
            .into_iter()
            .map(|e| OutboxEntry {
                status: OutboxStatus::Syncing,
                ..e
            })
            .collect())
    }

    fn mark_synced(&self, ids: &[i64], now: DateTime<Utc>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let synced_at = to_sql(now);
        for id in ids {
            tx.execute(
                "UPDATE sync_outbox SET status = 'synced', synced_at = ?1, last_error = NULL
                 WHERE id = ?2",
                params![synced_at, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_attempt_failed(
        &self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let status = match retry_at {
            Some(_) => OutboxStatus::Pending,
            None => OutboxStatus::Failed,
        };
        self.conn.execute(
            "UPDATE sync_outbox
             SET status = ?1, attempts = attempts + 1, last_error = ?2, next_retry_at = ?3
             WHERE id = ?4",
            params![status.as_str(), error, date_utils::to_sql_opt(retry_at), id],
        )?;
        self.conn
            .query_row("SELECT attempts FROM sync_outbox WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(Into::into)
    }

    fn get_outbox_entry(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM sync_outbox WHERE id = ?1");
        self.conn
            .query_row(&sql, [id], read_entry)
            .optional()
            .map_err(Into::into)
    }

    fn pending_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM sync_outbox WHERE status = 'pending'
             ORDER BY created_at, id LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map([limit as i64], read_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn pending_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_outbox WHERE status != 'synced'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn stuck_entries(&self) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM sync_outbox WHERE status = 'failed'
             ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], read_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn retry_stuck(&self) -> Result<usize> {
        let count = self.conn.execute(
            "UPDATE sync_outbox SET status = 'pending', attempts = 0, next_retry_at = NULL
             WHERE status = 'failed'",
            [],
        )?;
        Ok(count)
    }

    fn recover_inflight(&self) -> Result<usize> {
        let count = self.conn.execute(
            "UPDATE sync_outbox SET status = 'pending' WHERE status = 'syncing'",
            [],
        )?;
        Ok(count)
    }

    fn prune_synced(&self) -> Result<usize> {
        let count = self
            .conn
            .execute("DELETE FROM sync_outbox WHERE status = 'synced'", [])?;
        Ok(count)
    }

    fn has_unpushed(&self, table: SyncTable, record_id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sync_outbox
             WHERE table_name = ?1 AND record_id = ?2 AND status != 'synced')",
            params![table.as_str(), record_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn drop_unpushed(&self, table: SyncTable, record_id: &str) -> Result<usize> {
        let count = self.conn.execute(
            "DELETE FROM sync_outbox
             WHERE table_name = ?1 AND record_id = ?2 AND status IN ('pending', 'failed')",
            params![table.as_str(), record_id],
        )?;
        Ok(count)
    }
}

fn read_conflict(row: &Row<'_>) -> rusqlite::Result<ParkedConflict> {
    let table_name: String = row.get(1)?;
    let table = SyncTable::parse(&table_name).map_err(|e| invalid_text(1, e.to_string()))?;
    let local: String = row.get(3)?;
    let remote: String = row.get(4)?;
    Ok(ParkedConflict {
        id: row.get(0)?,
        table,
        record_id: row.get(2)?,
        local: SyncPayload::from_json(table, &local).map_err(|e| invalid_text(3, e.to_string()))?,
        remote: SyncPayload::from_json(table, &remote)
            .map_err(|e| invalid_text(4, e.to_string()))?,
        remote_seq: row.get(5)?,
        detected_at: date_utils::get(row, 6)?,
    })
}

const CONFLICT_COLUMNS: &str =
    "id, table_name, record_id, local_data, remote_data, remote_seq, detected_at";

impl SyncStateRepository for SqliteRepository {
    fn get_cursor(&self, table: SyncTable) -> Result<i64> {
        let cursor: Option<i64> = self
            .conn
            .query_row(
                "SELECT cursor FROM sync_cursor WHERE table_name = ?1",
                [table.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.unwrap_or(0))
    }

    fn set_cursor(&self, table: SyncTable, cursor: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_cursor (table_name, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name) DO UPDATE SET
                cursor = MAX(cursor, excluded.cursor),
                updated_at = excluded.updated_at",
            params![table.as_str(), cursor, to_sql(now)],
        )?;
        Ok(())
    }

    fn park_conflict(
        &self,
        local: &SyncPayload,
        remote: &SyncPayload,
        remote_seq: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflict
                (table_name, record_id, local_data, remote_data, remote_seq, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                local.table().as_str(),
                local.record_id(),
                local.to_json()?,
                remote.to_json()?,
                remote_seq,
                to_sql(now)
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn pending_conflicts(&self) -> Result<Vec<ParkedConflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflict WHERE resolved_at IS NULL ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let conflicts = stmt
            .query_map([], read_conflict)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    fn get_conflict(&self, id: i64) -> Result<Option<ParkedConflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflict WHERE id = ?1 AND resolved_at IS NULL"
        );
        self.conn
            .query_row(&sql, [id], read_conflict)
            .optional()
            .map_err(Into::into)
    }

    fn mark_conflict_resolved(
        &self,
        id: i64,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE sync_conflict SET resolved_at = ?1, resolution = ?2
             WHERE id = ?3 AND resolved_at IS NULL",
            params![to_sql(now), resolution, id],
        )?;
        if updated == 0 {
            return Err(DbError::not_found("sync_conflict", id.to_string()));
        }
        Ok(())
    }
}
