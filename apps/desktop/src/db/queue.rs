//! Storage for frozen daily practice queues.

use chrono::{DateTime, Utc};
use repertoire_core::sync::derived_id;
use repertoire_core::{
    Bucket, CardState, DailyPracticeQueueEntry, Goal, PlannedEntry, PracticeWindow,
    QueueCandidate, SyncMeta,
};
use rusqlite::{params, Row};
use serde::Serialize;

use super::date_utils::{self, to_sql};
use super::repository::{Result, SqliteRepository};
use super::rows;

/// A queue row as a practice screen shows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PracticeListRow {
    pub id: String,
    pub user_ref: String,
    pub repertoire_ref: String,
    pub tune_ref: String,
    pub title: Option<String>,
    pub queue_date: String,
    pub window_start_utc: DateTime<Utc>,
    pub window_end_utc: DateTime<Utc>,
    pub bucket: Bucket,
    pub order_index: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub card_state: Option<CardState>,
    pub due: Option<DateTime<Utc>>,
    pub goal: Option<Goal>,
}

impl PracticeListRow {
    pub fn is_remaining(&self) -> bool {
        self.completed_at.is_none()
    }
}

const LIST_COLUMNS: &str = "id, user_ref, repertoire_ref, tune_ref, title, queue_date, \
                            window_start_utc, window_end_utc, bucket, order_index, completed_at, \
                            active, card_state, due, goal";

/// `local_meta` key recording that a window's snapshot was generated.
fn generated_key(user_ref: &str, repertoire_ref: &str, window_start: &str) -> String {
    format!("queue_generated:{user_ref}:{repertoire_ref}:{window_start}")
}

fn conversion(idx: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, what.into())
}

fn read_list_row(row: &Row<'_>) -> rusqlite::Result<PracticeListRow> {
    let rank: i64 = row.get(8)?;
    let card_state = row
        .get::<_, Option<i64>>(12)?
        .map(|v| CardState::from_value(v).ok_or_else(|| conversion(12, format!("card state {v}"))))
        .transpose()?;
    let goal = row
        .get::<_, Option<String>>(14)?
        .map(|g| Goal::parse(&g).ok_or_else(|| conversion(14, format!("goal {g}"))))
        .transpose()?;

    Ok(PracticeListRow {
        id: row.get(0)?,
        user_ref: row.get(1)?,
        repertoire_ref: row.get(2)?,
        tune_ref: row.get(3)?,
        title: row.get(4)?,
        queue_date: row.get(5)?,
        window_start_utc: date_utils::get(row, 6)?,
        window_end_utc: date_utils::get(row, 7)?,
        bucket: Bucket::from_rank(rank).ok_or_else(|| conversion(8, format!("bucket {rank}")))?,
        order_index: row.get(9)?,
        completed_at: date_utils::get_opt(row, 10)?,
        active: row.get(11)?,
        card_state,
        due: date_utils::get_opt(row, 13)?,
        goal,
    })
}

/// Repository for daily queue snapshots.
pub trait QueueRepository {
    /// Active rows of the window starting at `window_start`, in queue order.
    fn active_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<PracticeListRow>>;

    /// Active rows of the most recent window that has any.
    fn latest_active_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
    ) -> Result<Vec<PracticeListRow>>;

    fn queue_candidates(&self, repertoire_ref: &str) -> Result<Vec<QueueCandidate>>;

    /// Whether this device generated the window's snapshot and it has not
    /// been invalidated since. True for an empty snapshot too.
    fn queue_generated(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window_start: DateTime<Utc>,
    ) -> Result<bool>;

    /// Store `planned` as the active snapshot for `window`, retiring active
    /// windows that start earlier. Later windows are left alone.
    fn persist_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window: &PracticeWindow,
        planned: &[PlannedEntry],
    ) -> Result<Vec<DailyPracticeQueueEntry>>;

    /// Deactivate a window so the next read regenerates it.
    fn invalidate_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window_start: DateTime<Utc>,
    ) -> Result<usize>;

    /// Stamp the active row for `tune_ref` whose window contains `at`.
    fn mark_queue_completed(
        &self,
        repertoire_ref: &str,
        tune_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

impl SqliteRepository {
    fn active_entries(
        &self,
        sql_filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DailyPracticeQueueEntry>> {
        let sql = format!(
            "{} WHERE active = 1 AND deleted = 0 AND {sql_filter}",
            rows::select_sql::<DailyPracticeQueueEntry>()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params, rows::read_row::<DailyPracticeQueueEntry>)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl QueueRepository for SqliteRepository {
    fn active_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<PracticeListRow>> {
        let sql = format!(
            "SELECT {LIST_COLUMNS} FROM practice_list_view
             WHERE user_ref = ?1 AND repertoire_ref = ?2 AND window_start_utc = ?3 AND active = 1
             ORDER BY order_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![user_ref, repertoire_ref, to_sql(window_start)],
                read_list_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn latest_active_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
    ) -> Result<Vec<PracticeListRow>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(window_start_utc) FROM practice_list_view
             WHERE user_ref = ?1 AND repertoire_ref = ?2 AND active = 1",
            params![user_ref, repertoire_ref],
            |row| row.get(0),
        )?;
        match latest {
            Some(start) => self.active_queue(user_ref, repertoire_ref, date_utils::parse(0, &start)?),
            None => Ok(Vec::new()),
        }
    }

    fn queue_candidates(&self, repertoire_ref: &str) -> Result<Vec<QueueCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT rt.tune_ref, pr.practiced, pr.due, rt.scheduled
             FROM repertoire_tune rt
             LEFT JOIN practice_record pr
                ON pr.repertoire_ref = rt.repertoire_ref AND pr.tune_ref = rt.tune_ref
                AND pr.deleted = 0
             WHERE rt.repertoire_ref = ?1 AND rt.deleted = 0
             ORDER BY rt.tune_ref",
        )?;
        let candidates = stmt
            .query_map([repertoire_ref], |row| {
                let practiced: Option<String> = row.get(1)?;
                Ok(QueueCandidate {
                    tune_ref: row.get(0)?,
                    practiced: practiced.is_some(),
                    due: date_utils::get_opt(row, 2)?,
                    scheduled: date_utils::get_opt(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(candidates)
    }

    fn queue_generated(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window_start: DateTime<Utc>,
    ) -> Result<bool> {
        let key = generated_key(user_ref, repertoire_ref, &to_sql(window_start));
        Ok(SqliteRepository::read_meta(&self.conn, &key)?.is_some())
    }

    fn persist_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window: &PracticeWindow,
        planned: &[PlannedEntry],
    ) -> Result<Vec<DailyPracticeQueueEntry>> {
        let now = self.now();
        let window_start = to_sql(window.start);
        let stale = self.active_entries(
            "user_ref = ?1 AND repertoire_ref = ?2 AND window_start_utc <= ?3",
            &[&user_ref, &repertoire_ref, &window_start],
        )?;

        let tx = self.conn.unchecked_transaction()?;
        for mut entry in stale {
            entry.active = false;
            self.save_in(&tx, entry)?;
        }

        let mut stored = Vec::with_capacity(planned.len());
        for plan in planned {
            let id = derived_id(&[
                "daily_practice_queue",
                user_ref,
                repertoire_ref,
                &window_start,
                &plan.tune_ref,
            ]);
            let entry = match rows::select::<DailyPracticeQueueEntry>(&tx, &id)? {
                Some(existing) => DailyPracticeQueueEntry {
                    bucket: plan.bucket,
                    order_index: plan.order_index,
                    active: true,
                    ..existing
                },
                None => DailyPracticeQueueEntry {
                    id,
                    user_ref: user_ref.to_string(),
                    repertoire_ref: repertoire_ref.to_string(),
                    tune_ref: plan.tune_ref.clone(),
                    queue_date: window.queue_date(),
                    window_start_utc: window.start,
                    window_end_utc: window.end,
                    bucket: plan.bucket,
                    order_index: plan.order_index,
                    completed_at: None,
                    active: true,
                    sync: SyncMeta::new(now),
                },
            };
            stored.push(self.save_in(&tx, entry)?);
        }
        SqliteRepository::write_meta(
            &tx,
            &generated_key(user_ref, repertoire_ref, &window_start),
            &to_sql(now),
        )?;
        tx.commit()?;
        Ok(stored)
    }

    fn invalidate_queue(
        &self,
        user_ref: &str,
        repertoire_ref: &str,
        window_start: DateTime<Utc>,
    ) -> Result<usize> {
        let start = to_sql(window_start);
        let entries = self.active_entries(
            "user_ref = ?1 AND repertoire_ref = ?2 AND window_start_utc = ?3",
            &[&user_ref, &repertoire_ref, &start],
        )?;

        let tx = self.conn.unchecked_transaction()?;
        let count = entries.len();
        for mut entry in entries {
            entry.active = false;
            self.save_in(&tx, entry)?;
        }
        SqliteRepository::delete_meta(&tx, &generated_key(user_ref, repertoire_ref, &start))?;
        tx.commit()?;
        Ok(count)
    }

    fn mark_queue_completed(
        &self,
        repertoire_ref: &str,
        tune_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let at_sql = to_sql(at);
        let entries = self.active_entries(
            "repertoire_ref = ?1 AND tune_ref = ?2
             AND window_start_utc <= ?3 AND window_end_utc > ?3",
            &[&repertoire_ref, &tune_ref, &at_sql],
        )?;
        let Some(mut entry) = entries.into_iter().next() else {
            return Ok(false);
        };
        entry.completed_at = Some(at);
        self.save(entry)?;
        Ok(true)
    }
}
