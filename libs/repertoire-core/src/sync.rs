//! Sync metadata, tagged payloads and the wire types exchanged with the remote store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PayloadError;
use crate::types::{
    DailyPracticeQueueEntry, PracticeRecord, PrefsSpacedRepetition, Repertoire, RepertoireTune,
    Tune, UserSchedulingOptions,
};

/// Per-row replication metadata carried by every syncable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncMeta {
    /// Monotonic per-record version; never decreases on any replica.
    pub sync_version: i64,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl SyncMeta {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            sync_version: 0,
            last_modified_at: now,
            device_id: None,
            deleted: false,
        }
    }
}

/// Tables that participate in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Tune,
    Repertoire,
    RepertoireTune,
    PrefsSpacedRepetition,
    UserSchedulingOptions,
    PracticeRecord,
    DailyPracticeQueue,
}

impl SyncTable {
    /// All tables, parents before children.
    pub const ALL: [SyncTable; 7] = [
        SyncTable::Tune,
        SyncTable::Repertoire,
        SyncTable::RepertoireTune,
        SyncTable::PrefsSpacedRepetition,
        SyncTable::UserSchedulingOptions,
        SyncTable::PracticeRecord,
        SyncTable::DailyPracticeQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tune => "tune",
            Self::Repertoire => "repertoire",
            Self::RepertoireTune => "repertoire_tune",
            Self::PrefsSpacedRepetition => "prefs_spaced_repetition",
            Self::UserSchedulingOptions => "user_scheduling_options",
            Self::PracticeRecord => "practice_record",
            Self::DailyPracticeQueue => "daily_practice_queue",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PayloadError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PayloadError::UnknownTable(s.to_string()))
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything carrying [`SyncMeta`].
pub trait SyncRecord {
    fn sync_meta(&self) -> &SyncMeta;
    fn sync_meta_mut(&mut self) -> &mut SyncMeta;
}

/// A record stored in one of the replicated tables.
pub trait Syncable: SyncRecord + Clone + Serialize + DeserializeOwned + Send + 'static {
    const TABLE: SyncTable;

    fn record_id(&self) -> &str;

    fn into_payload(self) -> SyncPayload;

    fn from_payload(payload: SyncPayload) -> Option<Self>;
}

macro_rules! syncable {
    ($ty:ty, $table:ident) => {
        impl SyncRecord for $ty {
            fn sync_meta(&self) -> &SyncMeta {
                &self.sync
            }

            fn sync_meta_mut(&mut self) -> &mut SyncMeta {
                &mut self.sync
            }
        }

        impl Syncable for $ty {
            const TABLE: SyncTable = SyncTable::$table;

            fn record_id(&self) -> &str {
                &self.id
            }

            fn into_payload(self) -> SyncPayload {
                SyncPayload::$table(self)
            }

            fn from_payload(payload: SyncPayload) -> Option<Self> {
                match payload {
                    SyncPayload::$table(record) => Some(record),
                    _ => None,
                }
            }
        }
    };
}

syncable!(Tune, Tune);
syncable!(Repertoire, Repertoire);
syncable!(RepertoireTune, RepertoireTune);
syncable!(PrefsSpacedRepetition, PrefsSpacedRepetition);
syncable!(UserSchedulingOptions, UserSchedulingOptions);
syncable!(PracticeRecord, PracticeRecord);
syncable!(DailyPracticeQueueEntry, DailyPracticeQueue);

/// A snapshot of one replicated row, tagged by table.
///
/// Deserialization validates the record against its table's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum SyncPayload {
    Tune(Tune),
    Repertoire(Repertoire),
    RepertoireTune(RepertoireTune),
    PrefsSpacedRepetition(PrefsSpacedRepetition),
    UserSchedulingOptions(UserSchedulingOptions),
    PracticeRecord(PracticeRecord),
    DailyPracticeQueue(DailyPracticeQueueEntry),
}

impl SyncPayload {
    pub fn table(&self) -> SyncTable {
        match self {
            Self::Tune(_) => SyncTable::Tune,
            Self::Repertoire(_) => SyncTable::Repertoire,
            Self::RepertoireTune(_) => SyncTable::RepertoireTune,
            Self::PrefsSpacedRepetition(_) => SyncTable::PrefsSpacedRepetition,
            Self::UserSchedulingOptions(_) => SyncTable::UserSchedulingOptions,
            Self::PracticeRecord(_) => SyncTable::PracticeRecord,
            Self::DailyPracticeQueue(_) => SyncTable::DailyPracticeQueue,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            Self::Tune(r) => &r.id,
            Self::Repertoire(r) => &r.id,
            Self::RepertoireTune(r) => &r.id,
            Self::PrefsSpacedRepetition(r) => &r.id,
            Self::UserSchedulingOptions(r) => &r.id,
            Self::PracticeRecord(r) => &r.id,
            Self::DailyPracticeQueue(r) => &r.id,
        }
    }

    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a payload and check it belongs to `expected`.
    pub fn from_json(expected: SyncTable, json: &str) -> Result<Self, PayloadError> {
        let payload: SyncPayload = serde_json::from_str(json)?;
        if payload.table() != expected {
            return Err(PayloadError::WrongTable {
                expected,
                actual: payload.table(),
            });
        }
        Ok(payload)
    }
}

impl SyncRecord for SyncPayload {
    fn sync_meta(&self) -> &SyncMeta {
        match self {
            Self::Tune(r) => r.sync_meta(),
            Self::Repertoire(r) => r.sync_meta(),
            Self::RepertoireTune(r) => r.sync_meta(),
            Self::PrefsSpacedRepetition(r) => r.sync_meta(),
            Self::UserSchedulingOptions(r) => r.sync_meta(),
            Self::PracticeRecord(r) => r.sync_meta(),
            Self::DailyPracticeQueue(r) => r.sync_meta(),
        }
    }

    fn sync_meta_mut(&mut self) -> &mut SyncMeta {
        match self {
            Self::Tune(r) => r.sync_meta_mut(),
            Self::Repertoire(r) => r.sync_meta_mut(),
            Self::RepertoireTune(r) => r.sync_meta_mut(),
            Self::PrefsSpacedRepetition(r) => r.sync_meta_mut(),
            Self::UserSchedulingOptions(r) => r.sync_meta_mut(),
            Self::PracticeRecord(r) => r.sync_meta_mut(),
            Self::DailyPracticeQueue(r) => r.sync_meta_mut(),
        }
    }
}

/// Mutation kind recorded in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Fold a newer mutation into a pending one for the same record.
    pub fn coalesce(self, newer: Operation) -> Operation {
        match (self, newer) {
            (Self::Insert, Self::Update) => Self::Insert,
            (_, Self::Delete) => Self::Delete,
            (Self::Delete, _) => Self::Update,
            (_, newer) => newer,
        }
    }
}

/// Lifecycle of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// === Wire types ===

/// One outbox change sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub operation: Operation,
    pub payload: SyncPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub changes: Vec<RemoteChange>,
}

/// What the remote did with a pushed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AckOutcome {
    /// Stored; `seq` is the server-assigned sequence of the write.
    Applied { seq: i64 },
    /// The stored copy won; the pushed change was discarded.
    Superseded { seq: i64 },
    /// Delete of a record the remote never stored.
    NotFound,
    /// Refused for a reason retrying will not fix.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    pub table: SyncTable,
    pub record_id: String,
    #[serde(flatten)]
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub acks: Vec<PushAck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub table: SyncTable,
    pub cursor: i64,
    pub limit: u32,
}

/// A remote row tagged with the server sequence of its last write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub seq: i64,
    pub payload: SyncPayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullResponse {
    /// Rows ordered by ascending sequence.
    pub rows: Vec<RemoteRow>,
    pub has_more: bool,
    /// Highest sequence in `rows`, if any.
    #[serde(default)]
    pub max_seq: Option<i64>,
}

impl PullResponse {
    pub fn new(rows: Vec<RemoteRow>, has_more: bool) -> Self {
        let max_seq = rows.iter().map(|r| r.seq).max();
        Self {
            rows,
            has_more,
            max_seq,
        }
    }
}

// === Identifiers ===

const ID_NAMESPACE: Uuid = Uuid::from_u128(0x5b1f_1a6e_8c0d_4f4e_9a57_2d3c_6e0b_7a91);

/// Stable id derived from natural keys, so devices that create the same
/// logical row offline produce the same id.
pub fn derived_id(parts: &[&str]) -> String {
    Uuid::new_v5(&ID_NAMESPACE, parts.join("\u{1f}").as_bytes()).to_string()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
