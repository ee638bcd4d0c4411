//! Application state.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::SqliteRepository;
use crate::practice::FeedbackCache;
use crate::sync::{RemoteStore, SharedRepository, SyncConfig, SyncEngine};

/// Global application state.
pub struct AppState {
    pub repository: SharedRepository,
    /// `None` while running without a remote.
    pub engine: Option<SyncEngine>,
    pub feedback: Arc<FeedbackCache>,
}

impl AppState {
    pub fn new(repository: SqliteRepository) -> Self {
        Self {
            repository: Arc::new(Mutex::new(repository)),
            engine: None,
            feedback: Arc::new(FeedbackCache::new()),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        self.engine = Some(SyncEngine::new(self.repository.clone(), remote, config));
        self
    }
}
