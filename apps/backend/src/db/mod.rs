//! PostgreSQL storage for replicated rows

use repertoire_core::{plan_remote_write, RemoteWrite, SyncRecord};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, Transaction};

use crate::error::Result;
use crate::models::*;

/// Advisory lock key held by every push transaction.
///
/// Pushes are serialized so that sequence order matches commit order and a
/// pull can never skip a row committed after it read a higher sequence.
const PUSH_LOCK_KEY: i64 = 0x7265_7065_7274;

/// Database wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL and create connection pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // === Push ===

    /// Apply a batch of changes in order, one ack per change.
    ///
    /// The whole batch commits or none of it does.
    pub async fn push(&self, changes: &[RemoteChange]) -> Result<Vec<PushAck>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PUSH_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let mut acks = Vec::with_capacity(changes.len());
        for change in changes {
            let table = change.payload.table();
            let record_id = change.payload.record_id().to_string();

            let existing = Self::lock_row(&mut tx, table, &record_id).await?;
            let outcome = match plan_remote_write(existing.as_ref(), change) {
                RemoteWrite::Ack(outcome) => outcome,
                RemoteWrite::Store(stored) => {
                    let seq = Self::store_row(&mut tx, &stored).await?;
                    AckOutcome::Applied { seq }
                }
            };
            acks.push(PushAck {
                table,
                record_id,
                outcome,
            });
        }

        tx.commit().await?;
        Ok(acks)
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        table: SyncTable,
        record_id: &str,
    ) -> Result<Option<RemoteRow>> {
        let row = sqlx::query_as::<_, DbSyncRow>(
            r#"
            SELECT table_name, record_id, data, sync_version, last_modified_at,
                   device_id, deleted, seq
            FROM sync_rows
            WHERE table_name = $1 AND record_id = $2
            FOR UPDATE
            "#,
        )
        .bind(table.as_str())
        .bind(record_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(DbSyncRow::into_remote_row))
    }

    async fn store_row(tx: &mut Transaction<'_, Postgres>, payload: &SyncPayload) -> Result<i64> {
        let meta = payload.sync_meta();
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_rows
                (table_name, record_id, data, sync_version, last_modified_at, device_id, deleted, seq)
            VALUES ($1, $2, $3, $4, $5, $6, $7, nextval('sync_seq'))
            ON CONFLICT (table_name, record_id) DO UPDATE SET
                data = EXCLUDED.data,
                sync_version = EXCLUDED.sync_version,
                last_modified_at = EXCLUDED.last_modified_at,
                device_id = EXCLUDED.device_id,
                deleted = EXCLUDED.deleted,
                seq = EXCLUDED.seq,
                updated_at = NOW()
            RETURNING seq
            "#,
        )
        .bind(payload.table().as_str())
        .bind(payload.record_id())
        .bind(Json(payload))
        .bind(meta.sync_version)
        .bind(meta.last_modified_at)
        .bind(meta.device_id.as_deref())
        .bind(meta.deleted)
        .fetch_one(&mut **tx)
        .await?;

        Ok(seq)
    }

    // === Pull ===

    /// Rows of `table` written after `cursor`, ascending by sequence.
    ///
    /// Fetches one row past `limit` to report whether more remain.
    pub async fn rows_since(&self, table: SyncTable, cursor: i64, limit: i64) -> Result<PullResponse> {
        let mut rows = sqlx::query_as::<_, DbSyncRow>(
            r#"
            SELECT table_name, record_id, data, sync_version, last_modified_at,
                   device_id, deleted, seq
            FROM sync_rows
            WHERE table_name = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(table.as_str())
        .bind(cursor)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);
        Ok(PullResponse::new(
            rows.into_iter().map(DbSyncRow::into_remote_row).collect(),
            has_more,
        ))
    }

    /// Fetch one stored row, tombstones included.
    pub async fn get_row(&self, table: SyncTable, record_id: &str) -> Result<Option<RemoteRow>> {
        let row = sqlx::query_as::<_, DbSyncRow>(
            r#"
            SELECT table_name, record_id, data, sync_version, last_modified_at,
                   device_id, deleted, seq
            FROM sync_rows
            WHERE table_name = $1 AND record_id = $2
            "#,
        )
        .bind(table.as_str())
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DbSyncRow::into_remote_row))
    }

    // === Stats ===

    pub async fn table_stats(&self) -> Result<Vec<TableStats>> {
        let stats = sqlx::query_as::<_, TableStats>(
            r#"
            SELECT table_name,
                   COUNT(*) AS rows,
                   COUNT(*) FILTER (WHERE deleted) AS deleted,
                   MAX(seq) AS max_seq
            FROM sync_rows
            GROUP BY table_name
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(stats)
    }
}
