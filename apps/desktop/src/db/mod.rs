//! Local SQLite database operations.

pub mod date_utils;
pub mod error;
pub mod outbox;
pub mod queue;
pub mod repository;
pub mod rows;
pub mod schema;

pub use error::DbError;
pub use outbox::{OutboxEntry, OutboxRepository, ParkedConflict, SyncStateRepository};
pub use queue::{PracticeListRow, QueueRepository};
pub use repository::{CaptureSuppression, PracticeRepository, SqliteRepository};
pub use rows::LocalRecord;
