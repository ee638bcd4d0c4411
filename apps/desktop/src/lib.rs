//! Offline-first practice engine: local store, change capture, sync and
//! the daily practice queue.

pub mod commands;
pub mod config;
pub mod db;
pub mod practice;
pub mod state;
pub mod sync;
pub mod workers;

pub use config::AppConfig;
pub use db::{DbError, SqliteRepository};
pub use state::AppState;
pub use sync::{SyncConfig, SyncEngine, SyncError, SyncReport, SyncStatus};
