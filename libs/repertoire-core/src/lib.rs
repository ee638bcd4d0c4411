//! Core practice library shared by the local engine and the sync server.
//!
//! Provides:
//! - Shared types (PracticeRecord, CardState, Rating, Bucket, etc.)
//! - Sync metadata, tagged table payloads and the remote wire types
//! - Conflict detection and resolution
//! - FSRS scheduling with goal-specific interval ladders
//! - Daily queue window classification and ordering

pub mod algorithm;
pub mod clock;
pub mod conflict;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use conflict::{
    detect_conflict, plan_remote_write, remote_accepts, resolve_conflict, Conflict,
    ConflictStrategy, RemoteWrite, Resolution, Winner,
};
pub use error::{ConflictError, PayloadError, ScheduleError};
pub use queue::{plan_queue, PlannedEntry, PracticeWindow, QueueCandidate, QueueLimits};
pub use scheduler::{ReviewInput, ScheduleResult, Scheduler};
pub use sync::{
    AckOutcome, Operation, OutboxStatus, PullRequest, PullResponse, PushAck, PushRequest,
    PushResponse, RemoteChange, RemoteRow, SyncMeta, SyncPayload, SyncRecord, SyncTable, Syncable,
};
pub use types::{
    Algorithm, Bucket, CardState, DailyPracticeQueueEntry, Goal, PracticeRecord,
    PrefsSpacedRepetition, Rating, Repertoire, RepertoireTune, Tune, UserSchedulingOptions,
};
