//! Common test utilities for integration tests.
//!
//! # Requirements
//! Integration tests require a PostgreSQL database (set DATABASE_URL).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, TimeZone, Utc};

use repertoire_backend::db::Database;
use repertoire_backend::models::SyncTable;
use repertoire_backend::{router, AppState};
use repertoire_core::{Operation, RemoteChange, SyncMeta, SyncPayload, Tune};

/// Test context containing database connection and router.
pub struct TestContext {
    pub db: Arc<Database>,
    app: Router,
    prefix: String,
}

impl TestContext {
    /// Create a new test context.
    ///
    /// # Panics
    /// Panics if DATABASE_URL is not set or database connection fails.
    pub async fn new() -> Self {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

        let db = Database::connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        db.run_migrations()
            .await
            .expect("Failed to run migrations");

        let db = Arc::new(db);
        let app = router(AppState { db: db.clone() });

        static NEXT: AtomicU64 = AtomicU64::new(0);
        let prefix = format!(
            "test-{}-{}",
            Utc::now().timestamp_micros(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );

        Self { db, app, prefix }
    }

    /// Get the router for use with axum-test.
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    /// A record id unique to this context.
    pub fn id(&self, name: &str) -> String {
        format!("{}-{}", self.prefix, name)
    }

    /// Remove every row this context wrote.
    pub async fn cleanup(&self) {
        let _ = sqlx::query("DELETE FROM sync_rows WHERE record_id LIKE $1")
            .bind(format!("{}-%", self.prefix))
            .execute(self.db.pool())
            .await;
    }

    /// Highest sequence currently stored, across all tables.
    pub async fn max_seq(&self) -> i64 {
        sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(seq) FROM sync_rows")
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to read max seq")
            .unwrap_or(0)
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 7, 9, 0, 0).unwrap()
}

pub fn tune(id: &str, title: &str, version: i64, at: DateTime<Utc>) -> SyncPayload {
    SyncPayload::Tune(Tune {
        id: id.to_string(),
        title: title.to_string(),
        genre: Some("reel".into()),
        sync: SyncMeta {
            sync_version: version,
            last_modified_at: at,
            device_id: Some("device-a".into()),
            deleted: false,
        },
    })
}

pub fn upsert(payload: SyncPayload) -> RemoteChange {
    RemoteChange {
        operation: Operation::Update,
        payload,
    }
}

pub fn delete(payload: SyncPayload) -> RemoteChange {
    RemoteChange {
        operation: Operation::Delete,
        payload,
    }
}

pub fn pull_body(table: SyncTable, cursor: i64, limit: u32) -> serde_json::Value {
    serde_json::json!({ "table": table, "cursor": cursor, "limit": limit })
}
