//! Row mapping between syncable records and their tables.

use repertoire_core::{
    Bucket, CardState, DailyPracticeQueueEntry, Goal, PracticeRecord, PrefsSpacedRepetition,
    Repertoire, RepertoireTune, SyncMeta, Syncable, Tune, UserSchedulingOptions,
};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

use super::date_utils::{self, to_sql, to_sql_opt};
use super::error::DbError;

type Result<T> = std::result::Result<T, DbError>;

const SYNC_COLUMNS: [&str; 4] = ["sync_version", "last_modified_at", "device_id", "deleted"];

/// A syncable record with a local table.
pub trait LocalRecord: Syncable {
    /// Entity columns in table order, `id` first. Sync columns follow implicitly.
    const COLUMNS: &'static [&'static str];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self>;

    /// Values for [`Self::COLUMNS`], in order.
    fn values(&self) -> Vec<Value>;
}

fn select_list<R: LocalRecord>() -> String {
    R::COLUMNS
        .iter()
        .chain(SYNC_COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT` prefix yielding rows readable by [`read_row`].
pub fn select_sql<R: LocalRecord>() -> String {
    format!("SELECT {} FROM {}", select_list::<R>(), R::TABLE.as_str())
}

pub fn read_row<R: LocalRecord>(row: &Row<'_>) -> rusqlite::Result<R> {
    let base = R::COLUMNS.len();
    let sync = SyncMeta {
        sync_version: row.get(base)?,
        last_modified_at: date_utils::get(row, base + 1)?,
        device_id: row.get(base + 2)?,
        deleted: row.get(base + 3)?,
    };
    R::from_row(row, sync)
}

pub fn select<R: LocalRecord>(conn: &Connection, id: &str) -> Result<Option<R>> {
    let sql = format!("{} WHERE id = ?1", select_sql::<R>());
    conn.query_row(&sql, [id], read_row::<R>)
        .optional()
        .map_err(Into::into)
}

/// Insert or overwrite the row, sync columns included.
pub fn write<R: LocalRecord>(conn: &Connection, record: &R) -> Result<()> {
    let columns: Vec<&str> = R::COLUMNS.iter().chain(SYNC_COLUMNS.iter()).copied().collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        R::TABLE.as_str(),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    );

    let meta = record.sync_meta();
    let mut values = record.values();
    values.push(Value::from(meta.sync_version));
    values.push(Value::from(to_sql(meta.last_modified_at)));
    values.push(Value::from(meta.device_id.clone()));
    values.push(Value::from(meta.deleted));

    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_value(value: &impl serde::Serialize) -> Value {
    Value::from(serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string()))
}

fn invalid(idx: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, what.into())
}

impl LocalRecord for Tune {
    const COLUMNS: &'static [&'static str] = &["id", "title", "genre"];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            genre: row.get(2)?,
            sync,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.clone()),
            Value::from(self.title.clone()),
            Value::from(self.genre.clone()),
        ]
    }
}

impl LocalRecord for Repertoire {
    const COLUMNS: &'static [&'static str] = &["id", "user_ref", "name"];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_ref: row.get(1)?,
            name: row.get(2)?,
            sync,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.clone()),
            Value::from(self.user_ref.clone()),
            Value::from(self.name.clone()),
        ]
    }
}

impl LocalRecord for RepertoireTune {
    const COLUMNS: &'static [&'static str] =
        &["id", "repertoire_ref", "tune_ref", "scheduled", "added_at"];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repertoire_ref: row.get(1)?,
            tune_ref: row.get(2)?,
            scheduled: date_utils::get_opt(row, 3)?,
            added_at: date_utils::get(row, 4)?,
            sync,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.clone()),
            Value::from(self.repertoire_ref.clone()),
            Value::from(self.tune_ref.clone()),
            Value::from(to_sql_opt(self.scheduled)),
            Value::from(to_sql(self.added_at)),
        ]
    }
}

impl LocalRecord for PracticeRecord {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "tune_ref",
        "repertoire_ref",
        "practiced",
        "quality",
        "difficulty",
        "stability",
        "interval",
        "elapsed_days",
        "repetitions",
        "lapses",
        "state",
        "due",
        "goal",
        "technique",
        "step",
    ];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self> {
        let state_code: i64 = row.get(11)?;
        let state = CardState::from_value(state_code)
            .ok_or_else(|| invalid(11, format!("unknown card state {state_code}")))?;
        let goal_name: String = row.get(13)?;
        let goal = Goal::parse(&goal_name)
            .ok_or_else(|| invalid(13, format!("unknown goal {goal_name}")))?;
        Ok(Self {
            id: row.get(0)?,
            tune_ref: row.get(1)?,
            repertoire_ref: row.get(2)?,
            practiced: date_utils::get_opt(row, 3)?,
            quality: row.get(4)?,
            difficulty: row.get(5)?,
            stability: row.get(6)?,
            interval: row.get(7)?,
            elapsed_days: row.get(8)?,
            repetitions: row.get(9)?,
            lapses: row.get(10)?,
            state,
            due: date_utils::get(row, 12)?,
            goal,
            technique: row.get(14)?,
            step: row.get(15)?,
            sync,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.clone()),
            Value::from(self.tune_ref.clone()),
            Value::from(self.repertoire_ref.clone()),
            Value::from(to_sql_opt(self.practiced)),
            Value::from(self.quality),
            Value::from(self.difficulty),
            Value::from(self.stability),
            Value::from(self.interval),
            Value::from(self.elapsed_days),
            Value::from(self.repetitions),
            Value::from(self.lapses),
            Value::from(self.state.to_value()),
            Value::from(to_sql(self.due)),
            Value::from(self.goal.as_str().to_string()),
            Value::from(self.technique.clone()),
            Value::from(self.step),
        ]
    }
}

impl LocalRecord for DailyPracticeQueueEntry {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "user_ref",
        "repertoire_ref",
        "tune_ref",
        "queue_date",
        "window_start_utc",
        "window_end_utc",
        "bucket",
        "order_index",
        "completed_at",
        "active",
    ];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self> {
        let rank: i64 = row.get(7)?;
        let bucket =
            Bucket::from_rank(rank).ok_or_else(|| invalid(7, format!("unknown bucket {rank}")))?;
        Ok(Self {
            id: row.get(0)?,
            user_ref: row.get(1)?,
            repertoire_ref: row.get(2)?,
            tune_ref: row.get(3)?,
            queue_date: row.get(4)?,
            window_start_utc: date_utils::get(row, 5)?,
            window_end_utc: date_utils::get(row, 6)?,
            bucket,
            order_index: row.get(8)?,
            completed_at: date_utils::get_opt(row, 9)?,
            active: row.get(10)?,
            sync,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.clone()),
            Value::from(self.user_ref.clone()),
            Value::from(self.repertoire_ref.clone()),
            Value::from(self.tune_ref.clone()),
            Value::from(self.queue_date.clone()),
            Value::from(to_sql(self.window_start_utc)),
            Value::from(to_sql(self.window_end_utc)),
            Value::from(self.bucket.rank()),
            Value::from(self.order_index),
            Value::from(to_sql_opt(self.completed_at)),
            Value::from(self.active),
        ]
    }
}

impl LocalRecord for PrefsSpacedRepetition {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "alg_type",
        "weights",
        "request_retention",
        "maximum_interval",
        "learning_steps",
        "relearning_steps",
        "enable_fuzzing",
    ];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            alg_type: row.get(1)?,
            weights: json_column(row, 2)?,
            request_retention: row.get(3)?,
            maximum_interval: row.get(4)?,
            learning_steps: json_column(row, 5)?,
            relearning_steps: json_column(row, 6)?,
            enable_fuzzing: row.get(7)?,
            sync,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.clone()),
            Value::from(self.alg_type.clone()),
            json_value(&self.weights),
            Value::from(self.request_retention),
            Value::from(self.maximum_interval),
            json_value(&self.learning_steps),
            json_value(&self.relearning_steps),
            Value::from(self.enable_fuzzing),
        ]
    }
}

impl LocalRecord for UserSchedulingOptions {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "acceptable_delinquency_window",
        "min_reviews_per_day",
        "max_reviews_per_day",
        "auto_schedule_new",
    ];

    fn from_row(row: &Row<'_>, sync: SyncMeta) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            acceptable_delinquency_window: row.get(1)?,
            min_reviews_per_day: row.get(2)?,
            max_reviews_per_day: row.get(3)?,
            auto_schedule_new: row.get(4)?,
            sync,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id.clone()),
            Value::from(self.acceptable_delinquency_window),
            Value::from(self.min_reviews_per_day),
            Value::from(self.max_reviews_per_day),
            Value::from(self.auto_schedule_new),
        ]
    }
}
