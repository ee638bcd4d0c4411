//! SQLite schema definitions.

/// Current schema version for migrations.
pub const SCHEMA_VERSION: i32 = 1;

/// Entity tables, local bookkeeping and read views.
pub const SCHEMA: &str = r#"
-- Tune catalog
CREATE TABLE IF NOT EXISTS tune (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    genre TEXT,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    device_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS repertoire (
    id TEXT PRIMARY KEY,
    user_ref TEXT NOT NULL,
    name TEXT NOT NULL,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    device_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

-- Tune membership in a repertoire
CREATE TABLE IF NOT EXISTS repertoire_tune (
    id TEXT PRIMARY KEY,
    repertoire_ref TEXT NOT NULL,
    tune_ref TEXT NOT NULL,
    scheduled TEXT,
    added_at TEXT NOT NULL,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    device_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    UNIQUE (repertoire_ref, tune_ref)
);

-- One scheduling card per repertoire tune
CREATE TABLE IF NOT EXISTS practice_record (
    id TEXT PRIMARY KEY,
    tune_ref TEXT NOT NULL,
    repertoire_ref TEXT NOT NULL,
    practiced TEXT,
    quality INTEGER,
    difficulty REAL,
    stability REAL,
    interval INTEGER NOT NULL DEFAULT 0,
    elapsed_days REAL NOT NULL DEFAULT 0,
    repetitions INTEGER NOT NULL DEFAULT 0,
    lapses INTEGER NOT NULL DEFAULT 0,
    state INTEGER NOT NULL DEFAULT 0,
    due TEXT NOT NULL,
    goal TEXT NOT NULL DEFAULT 'recall',
    technique TEXT,
    step INTEGER NOT NULL DEFAULT 0,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    device_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    UNIQUE (repertoire_ref, tune_ref)
);

-- Frozen daily queue snapshots
CREATE TABLE IF NOT EXISTS daily_practice_queue (
    id TEXT PRIMARY KEY,
    user_ref TEXT NOT NULL,
    repertoire_ref TEXT NOT NULL,
    tune_ref TEXT NOT NULL,
    queue_date TEXT NOT NULL,
    window_start_utc TEXT NOT NULL,
    window_end_utc TEXT NOT NULL,
    bucket INTEGER NOT NULL,
    order_index INTEGER NOT NULL,
    completed_at TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    device_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS prefs_spaced_repetition (
    id TEXT PRIMARY KEY,
    alg_type TEXT NOT NULL DEFAULT 'FSRS',
    weights TEXT NOT NULL DEFAULT '[]',
    request_retention REAL NOT NULL DEFAULT 0.9,
    maximum_interval INTEGER NOT NULL DEFAULT 36500,
    learning_steps TEXT NOT NULL DEFAULT '[]',
    relearning_steps TEXT NOT NULL DEFAULT '[]',
    enable_fuzzing INTEGER NOT NULL DEFAULT 1,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    device_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_scheduling_options (
    id TEXT PRIMARY KEY,
    acceptable_delinquency_window INTEGER NOT NULL DEFAULT 7,
    min_reviews_per_day INTEGER NOT NULL DEFAULT 5,
    max_reviews_per_day INTEGER NOT NULL DEFAULT 20,
    auto_schedule_new INTEGER NOT NULL DEFAULT 1,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    device_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

-- Per-table pull watermark (server sequence)
CREATE TABLE IF NOT EXISTS sync_cursor (
    table_name TEXT PRIMARY KEY,
    cursor INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

-- Conflicts parked for manual resolution
CREATE TABLE IF NOT EXISTS sync_conflict (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    local_data TEXT NOT NULL,
    remote_data TEXT NOT NULL,
    remote_seq INTEGER NOT NULL,
    detected_at TEXT NOT NULL,
    resolved_at TEXT,
    resolution TEXT
);

CREATE TABLE IF NOT EXISTS local_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Queue rows joined with what a practice screen shows
CREATE VIEW IF NOT EXISTS practice_list_view AS
SELECT
    q.id,
    q.user_ref,
    q.repertoire_ref,
    q.tune_ref,
    t.title,
    q.queue_date,
    q.window_start_utc,
    q.window_end_utc,
    q.bucket,
    q.order_index,
    q.completed_at,
    q.active,
    pr.state AS card_state,
    pr.due AS due,
    pr.goal AS goal
FROM daily_practice_queue q
LEFT JOIN tune t ON t.id = q.tune_ref AND t.deleted = 0
LEFT JOIN practice_record pr
    ON pr.repertoire_ref = q.repertoire_ref AND pr.tune_ref = q.tune_ref AND pr.deleted = 0
WHERE q.deleted = 0;

-- Indexes
CREATE INDEX IF NOT EXISTS idx_repertoire_tune_rep ON repertoire_tune(repertoire_ref);
CREATE INDEX IF NOT EXISTS idx_practice_record_due ON practice_record(due);
CREATE INDEX IF NOT EXISTS idx_queue_lookup
    ON daily_practice_queue(user_ref, repertoire_ref, window_start_utc, active);
"#;

/// Change capture storage. Installed separately so a failure leaves the
/// store usable without an outbox.
pub const OUTBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'syncing', 'synced', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_retry_at TEXT,
    synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON sync_outbox(status, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_record ON sync_outbox(table_name, record_id);
"#;

/// Record the schema version if not present.
pub const INIT_SCHEMA_VERSION: &str = r#"
INSERT OR IGNORE INTO schema_version (version) VALUES (1);
"#;
