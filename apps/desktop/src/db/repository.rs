//! Repository pattern for database access.
//!
//! Every write to a syncable table goes through [`SqliteRepository::save_in`],
//! which stamps sync metadata and appends an outbox entry in the same
//! transaction. That hook is the change capture layer.

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use repertoire_core::sync::new_id;
use repertoire_core::{
    Clock, DailyPracticeQueueEntry, Operation, PracticeRecord, PrefsSpacedRepetition, Repertoire,
    RepertoireTune, SyncPayload, SyncRecord, SyncTable, Syncable, SystemClock, Tune,
    UserSchedulingOptions,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::error::DbError;
use super::outbox;
use super::rows::{self, LocalRecord};
use super::schema;

pub(crate) type Result<T> = std::result::Result<T, DbError>;

const DEVICE_ID_KEY: &str = "device_id";

/// Run `$body` with `$t` bound to the record type stored in `$table`.
macro_rules! with_record_type {
    ($table:expr, $t:ident => $body:expr) => {
        match $table {
            SyncTable::Tune => {
                type $t = Tune;
                $body
            }
            SyncTable::Repertoire => {
                type $t = Repertoire;
                $body
            }
            SyncTable::RepertoireTune => {
                type $t = RepertoireTune;
                $body
            }
            SyncTable::PrefsSpacedRepetition => {
                type $t = PrefsSpacedRepetition;
                $body
            }
            SyncTable::UserSchedulingOptions => {
                type $t = UserSchedulingOptions;
                $body
            }
            SyncTable::PracticeRecord => {
                type $t = PracticeRecord;
                $body
            }
            SyncTable::DailyPracticeQueue => {
                type $t = DailyPracticeQueueEntry;
                $body
            }
        }
    };
}

/// Repository for repertoire and scheduling lookups.
pub trait PracticeRepository {
    fn get_repertoire(&self, id: &str) -> Result<Option<Repertoire>>;
    fn get_repertoire_tune(&self, repertoire_ref: &str, tune_ref: &str)
        -> Result<Option<RepertoireTune>>;
    fn count_repertoire_tunes(&self, repertoire_ref: &str) -> Result<usize>;
    fn get_practice_record(&self, repertoire_ref: &str, tune_ref: &str)
        -> Result<Option<PracticeRecord>>;
    fn get_prefs(&self, user_ref: &str) -> Result<Option<PrefsSpacedRepetition>>;
    fn get_scheduling_options(&self, user_ref: &str) -> Result<Option<UserSchedulingOptions>>;
}

/// Change capture state.
struct Capture {
    installed: bool,
    suppressed: Cell<u32>,
}

/// Disables change capture until dropped.
pub struct CaptureSuppression<'a> {
    suppressed: &'a Cell<u32>,
}

impl Drop for CaptureSuppression<'_> {
    fn drop(&mut self) {
        self.suppressed.set(self.suppressed.get().saturating_sub(1));
    }
}

/// SQLite implementation of repositories.
pub struct SqliteRepository {
    pub(crate) conn: Connection,
    device_id: String,
    clock: Arc<dyn Clock>,
    capture: Capture,
}

impl SqliteRepository {
    /// Open database at path, creating if necessary.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(schema::SCHEMA)?;
        conn.execute_batch(schema::INIT_SCHEMA_VERSION)?;
        let installed = match conn.execute_batch(schema::OUTBOX_SCHEMA) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "change capture unavailable, running local-only");
                false
            }
        };

        let device_id = match Self::read_meta(&conn, DEVICE_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = new_id();
                Self::write_meta(&conn, DEVICE_ID_KEY, &id)?;
                id
            }
        };

        Ok(Self {
            conn,
            device_id,
            clock: Arc::new(SystemClock),
            capture: Capture {
                installed,
                suppressed: Cell::new(0),
            },
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override and persist the device id.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();
        Self::write_meta(&self.conn, DEVICE_ID_KEY, &device_id)?;
        self.device_id = device_id;
        Ok(self)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current time at storage precision.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    pub fn capture_installed(&self) -> bool {
        self.capture.installed
    }

    pub fn capture_active(&self) -> bool {
        self.capture.installed && self.capture.suppressed.get() == 0
    }

    /// Mutations made while the guard lives are not captured.
    pub fn suppress_capture(&self) -> CaptureSuppression<'_> {
        self.capture.suppressed.set(self.capture.suppressed.get() + 1);
        CaptureSuppression {
            suppressed: &self.capture.suppressed,
        }
    }

    pub(super) fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row("SELECT value FROM local_meta WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    pub(super) fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO local_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub(super) fn delete_meta(conn: &Connection, key: &str) -> Result<()> {
        conn.execute("DELETE FROM local_meta WHERE key = ?1", [key])?;
        Ok(())
    }

    // === Captured writes ===

    pub fn get<R: LocalRecord>(&self, id: &str) -> Result<Option<R>> {
        rows::select(&self.conn, id)
    }

    /// Run `f` in one transaction. Saves made inside it join the transaction
    /// and nothing is kept if `f` fails.
    pub fn in_transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f()?;
        tx.commit()?;
        Ok(value)
    }

    /// Write `record` as a local mutation and return the stored row.
    pub fn save<R: LocalRecord>(&self, record: R) -> Result<R> {
        if !self.conn.is_autocommit() {
            return self.save_in(&self.conn, record);
        }
        let tx = self.conn.unchecked_transaction()?;
        let saved = self.save_in(&tx, record)?;
        tx.commit()?;
        Ok(saved)
    }

    /// [`Self::save`] inside a caller's transaction.
    pub(crate) fn save_in<R: LocalRecord>(&self, conn: &Connection, mut record: R) -> Result<R> {
        let id = record.record_id().to_string();
        let existing = rows::select::<R>(conn, &id)?;
        let now = self.now();

        let operation = match (&existing, record.sync_meta().deleted) {
            (_, true) => Operation::Delete,
            (Some(_), false) => Operation::Update,
            (None, false) => Operation::Insert,
        };

        let previous = existing.as_ref().map(|r| r.sync_meta().clone());
        let meta = record.sync_meta_mut();
        let base = previous.as_ref().map_or(0, |m| m.sync_version);
        meta.sync_version = base.max(meta.sync_version) + 1;
        meta.last_modified_at = match &previous {
            Some(prev) if prev.last_modified_at >= now => {
                prev.last_modified_at + Duration::milliseconds(1)
            }
            _ => now,
        };
        meta.device_id = Some(self.device_id.clone());

        rows::write(conn, &record)?;
        let stored = rows::select::<R>(conn, &id)?
            .ok_or_else(|| DbError::not_found(R::TABLE.as_str(), id.clone()))?;

        if self.capture_active() {
            outbox::enqueue(conn, operation, &stored.clone().into_payload(), now)?;
        }
        Ok(stored)
    }

    /// Mark a record deleted. Deletes are always soft.
    pub fn soft_delete<R: LocalRecord>(&self, id: &str) -> Result<R> {
        let mut record = self
            .get::<R>(id)?
            .ok_or_else(|| DbError::not_found(R::TABLE.as_str(), id))?;
        record.sync_meta_mut().deleted = true;
        self.save(record)
    }

    /// Drop a row from the local store. Captured as a remote soft delete.
    pub(crate) fn remove_in<R: LocalRecord>(&self, conn: &Connection, id: &str) -> Result<bool> {
        let Some(mut record) = rows::select::<R>(conn, id)? else {
            return Ok(false);
        };
        let sql = format!("DELETE FROM {} WHERE id = ?1", R::TABLE.as_str());
        conn.execute(&sql, [id])?;

        if self.capture_active() {
            let now = self.now();
            let meta = record.sync_meta_mut();
            meta.sync_version += 1;
            meta.last_modified_at = now.max(meta.last_modified_at + Duration::milliseconds(1));
            meta.device_id = Some(self.device_id.clone());
            meta.deleted = true;
            outbox::enqueue(conn, Operation::Delete, &record.into_payload(), now)?;
        }
        Ok(true)
    }

    // === Payload dispatch ===

    pub(crate) fn load_payload(
        &self,
        conn: &Connection,
        table: SyncTable,
        id: &str,
    ) -> Result<Option<SyncPayload>> {
        with_record_type!(table, R => Ok(rows::select::<R>(conn, id)?.map(Syncable::into_payload)))
    }

    /// Store a payload verbatim, bypassing change capture.
    pub(crate) fn write_payload(&self, conn: &Connection, payload: SyncPayload) -> Result<()> {
        let table = payload.table();
        with_record_type!(table, R => {
            let record = R::from_payload(payload)
                .ok_or_else(|| DbError::InvalidData(format!("payload is not a {table} row")))?;
            rows::write(conn, &record)
        })
    }

    /// Store a payload as a captured local mutation.
    pub(crate) fn save_payload(
        &self,
        conn: &Connection,
        payload: SyncPayload,
    ) -> Result<SyncPayload> {
        let table = payload.table();
        with_record_type!(table, R => {
            let record = R::from_payload(payload)
                .ok_or_else(|| DbError::InvalidData(format!("payload is not a {table} row")))?;
            Ok(self.save_in(conn, record)?.into_payload())
        })
    }

    // === Maintenance ===

    /// Remove cached tunes whose genre is not in `keep` and that no
    /// repertoire references. The outbox is not touched.
    pub fn purge_deselected_genres(&self, keep: &[String]) -> Result<usize> {
        let _quiet = self.suppress_capture();

        let mut sql = String::from(
            "SELECT id FROM tune WHERE genre IS NOT NULL
             AND id NOT IN (SELECT tune_ref FROM repertoire_tune WHERE deleted = 0)",
        );
        if !keep.is_empty() {
            let placeholders: Vec<String> = (1..=keep.len()).map(|i| format!("?{i}")).collect();
            sql.push_str(&format!(" AND genre NOT IN ({})", placeholders.join(", ")));
        }

        let tx = self.conn.unchecked_transaction()?;
        let ids = {
            let mut stmt = tx.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(keep.iter()), |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };
        let mut removed = 0;
        for id in &ids {
            if self.remove_in::<Tune>(&tx, id)? {
                removed += 1;
            }
        }
        tx.commit()?;
        debug!(removed, "purged deselected genres");
        Ok(removed)
    }
}

impl PracticeRepository for SqliteRepository {
    fn get_repertoire(&self, id: &str) -> Result<Option<Repertoire>> {
        let repertoire = self.get::<Repertoire>(id)?;
        Ok(repertoire.filter(|r| !r.sync.deleted))
    }

    fn get_repertoire_tune(
        &self,
        repertoire_ref: &str,
        tune_ref: &str,
    ) -> Result<Option<RepertoireTune>> {
        let sql = format!(
            "{} WHERE repertoire_ref = ?1 AND tune_ref = ?2 AND deleted = 0",
            rows::select_sql::<RepertoireTune>()
        );
        self.conn
            .query_row(&sql, params![repertoire_ref, tune_ref], rows::read_row)
            .optional()
            .map_err(Into::into)
    }

    fn count_repertoire_tunes(&self, repertoire_ref: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM repertoire_tune WHERE repertoire_ref = ?1 AND deleted = 0",
            [repertoire_ref],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get_practice_record(
        &self,
        repertoire_ref: &str,
        tune_ref: &str,
    ) -> Result<Option<PracticeRecord>> {
        let sql = format!(
            "{} WHERE repertoire_ref = ?1 AND tune_ref = ?2 AND deleted = 0",
            rows::select_sql::<PracticeRecord>()
        );
        self.conn
            .query_row(&sql, params![repertoire_ref, tune_ref], rows::read_row)
            .optional()
            .map_err(Into::into)
    }

    fn get_prefs(&self, user_ref: &str) -> Result<Option<PrefsSpacedRepetition>> {
        let prefs = self.get::<PrefsSpacedRepetition>(user_ref)?;
        Ok(prefs.filter(|p| !p.sync.deleted))
    }

    fn get_scheduling_options(&self, user_ref: &str) -> Result<Option<UserSchedulingOptions>> {
        let options = self.get::<UserSchedulingOptions>(user_ref)?;
        Ok(options.filter(|o| !o.sync.deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OutboxRepository;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use repertoire_core::{FixedClock, SyncMeta};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn repo() -> (SqliteRepository, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let repo = SqliteRepository::open_in_memory()
            .unwrap()
            .with_clock(clock.clone())
            .with_device_id("device-a")
            .unwrap();
        (repo, clock)
    }

    fn tune(id: &str, genre: &str) -> Tune {
        Tune {
            id: id.into(),
            title: format!("Tune {id}"),
            genre: Some(genre.into()),
            sync: SyncMeta::new(t0()),
        }
    }

    #[test]
    fn save_stamps_metadata_and_captures() {
        let (repo, _) = repo();
        let saved = repo.save(tune("t1", "irish")).unwrap();
        assert_eq!(saved.sync.sync_version, 1);
        assert_eq!(saved.sync.device_id.as_deref(), Some("device-a"));
        assert_eq!(saved.sync.last_modified_at, t0());

        let pending = repo.pending_entries(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Insert);
        assert_eq!(pending[0].record_id, "t1");
    }

    #[test]
    fn versions_never_decrease() {
        let (repo, clock) = repo();
        let mut record = repo.save(tune("t1", "irish")).unwrap();
        let mut last = record.sync.sync_version;
        for i in 0..5 {
            clock.advance(Duration::seconds(1));
            record.title = format!("edit {i}");
            record.sync.sync_version = 0;
            record = repo.save(record).unwrap();
            assert!(record.sync.sync_version > last);
            last = record.sync.sync_version;
        }
        assert_eq!(last, 6);
    }

    #[test]
    fn timestamps_advance_even_when_clock_stalls() {
        let (repo, _) = repo();
        let first = repo.save(tune("t1", "irish")).unwrap();
        let second = repo.save(first.clone()).unwrap();
        assert!(second.sync.last_modified_at > first.sync.last_modified_at);
    }

    #[test]
    fn edits_before_push_coalesce() {
        let (repo, clock) = repo();
        let mut record = repo.save(tune("t1", "irish")).unwrap();
        clock.advance(Duration::seconds(5));
        record.title = "Renamed".into();
        repo.save(record).unwrap();

        let pending = repo.pending_entries(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Insert);
        let payload = pending[0].payload().unwrap();
        let stored = Tune::from_payload(payload).unwrap();
        assert_eq!(stored.title, "Renamed");
        assert_eq!(stored.sync.sync_version, 2);
    }

    #[test]
    fn soft_delete_keeps_row() {
        let (repo, _) = repo();
        repo.save(tune("t1", "irish")).unwrap();
        let deleted = repo.soft_delete::<Tune>("t1").unwrap();
        assert!(deleted.sync.deleted);
        assert!(repo.get::<Tune>("t1").unwrap().unwrap().sync.deleted);
        assert_eq!(repo.pending_entries(10).unwrap()[0].operation, Operation::Delete);
    }

    #[test]
    fn suppressed_writes_skip_outbox() {
        let (repo, _) = repo();
        {
            let _quiet = repo.suppress_capture();
            assert!(!repo.capture_active());
            repo.save(tune("t1", "irish")).unwrap();
        }
        assert!(repo.capture_active());
        assert_eq!(repo.pending_count().unwrap(), 0);
        repo.save(tune("t2", "irish")).unwrap();
        assert_eq!(repo.pending_count().unwrap(), 1);
    }

    #[test]
    fn purge_removes_only_unreferenced_deselected_tunes() {
        let (repo, _) = repo();
        {
            let _quiet = repo.suppress_capture();
            repo.save(tune("keep", "irish")).unwrap();
            repo.save(tune("drop", "bluegrass")).unwrap();
            repo.save(tune("used", "bluegrass")).unwrap();
            repo.save(RepertoireTune {
                id: "rt1".into(),
                repertoire_ref: "r1".into(),
                tune_ref: "used".into(),
                scheduled: None,
                added_at: t0(),
                sync: SyncMeta::new(t0()),
            })
            .unwrap();
        }

        let removed = repo.purge_deselected_genres(&["irish".to_string()]).unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get::<Tune>("drop").unwrap().is_none());
        assert!(repo.get::<Tune>("keep").unwrap().is_some());
        assert!(repo.get::<Tune>("used").unwrap().is_some());
        assert_eq!(repo.pending_count().unwrap(), 0);
    }

    #[test]
    fn capture_install_failure_degrades_to_local_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("practice.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE VIEW sync_outbox AS SELECT 1 AS id;")
                .unwrap();
        }

        let repo = SqliteRepository::open(&path).unwrap();
        assert!(!repo.capture_installed());
        let saved = repo.save(tune("t1", "irish")).unwrap();
        assert_eq!(saved.sync.sync_version, 1);
    }

    #[test]
    fn device_id_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("practice.db");
        let first = SqliteRepository::open(&path).unwrap().device_id().to_string();
        let second = SqliteRepository::open(&path).unwrap().device_id().to_string();
        assert_eq!(first, second);
    }
}
