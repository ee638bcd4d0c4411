//! Agent configuration from environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DB_PATH: &str = "REPERTOIRE_DB_PATH";
pub const BACKEND_URL: &str = "REPERTOIRE_BACKEND_URL";
pub const DEVICE_ID: &str = "REPERTOIRE_DEVICE_ID";
pub const USER_ID: &str = "REPERTOIRE_USER_ID";
pub const SYNC_INTERVAL_SECS: &str = "REPERTOIRE_SYNC_INTERVAL_SECS";
pub const FLUSH_INTERVAL_SECS: &str = "REPERTOIRE_FLUSH_INTERVAL_SECS";
pub const SYNC_TIMEOUT_SECS: &str = "REPERTOIRE_SYNC_TIMEOUT_SECS";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a positive number of seconds, got {value:?}")]
    InvalidSeconds { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// Sync is disabled when unset.
    pub backend_url: Option<String>,
    /// Overrides the device id persisted in the local store.
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub sync_interval: Duration,
    pub flush_interval: Duration,
    pub sync_timeout: Duration,
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("repertoire")
        .join("practice.db")
}

fn seconds(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(key) {
        None => Ok(Duration::from_secs(default)),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidSeconds {
                key,
                value: value.clone(),
            }),
        },
    }
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let text = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            db_path: text(DB_PATH).map(PathBuf::from).unwrap_or_else(default_db_path),
            backend_url: text(BACKEND_URL),
            device_id: text(DEVICE_ID),
            user_id: text(USER_ID),
            sync_interval: seconds(&vars, SYNC_INTERVAL_SECS, 300)?,
            flush_interval: seconds(&vars, FLUSH_INTERVAL_SECS, 30)?,
            sync_timeout: seconds(&vars, SYNC_TIMEOUT_SECS, 30)?,
        })
    }
}
