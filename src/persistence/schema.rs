//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE ... IF NOT EXISTS`, safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table and index definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS work_item (
    id                  TEXT PRIMARY KEY NOT NULL,
    scope               TEXT NOT NULL,
    logical_key         TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('queued','running','completed','failed')),
    payload             TEXT NOT NULL,
    priority            INTEGER NOT NULL DEFAULT 0,
    result_text         TEXT,
    usage_input         INTEGER,
    usage_output        INTEGER,
    continuation_token  TEXT,
    duration_ms         INTEGER,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    heartbeat_at        TEXT,
    completed_at        TEXT,
    error_text          TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_work_item_active_key
    ON work_item(scope, logical_key)
    WHERE status IN ('queued','running');

CREATE INDEX IF NOT EXISTS idx_work_item_scope_status ON work_item(scope, status);
CREATE INDEX IF NOT EXISTS idx_work_item_queue ON work_item(status, priority, created_at);

CREATE TABLE IF NOT EXISTS ledger_event (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    scope           TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    work_item_id    TEXT NOT NULL,
    kind            TEXT NOT NULL CHECK(kind IN ('begun','enqueued','claimed','completed','failed','stale_recovered','retried')),
    detail          TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE(scope, seq)
);

CREATE INDEX IF NOT EXISTS idx_ledger_event_item ON ledger_event(work_item_id);

CREATE TABLE IF NOT EXISTS scope_sequence (
    scope           TEXT PRIMARY KEY NOT NULL,
    last_seq        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_account (
    id                  TEXT PRIMARY KEY NOT NULL,
    continuation_token  TEXT,
    usage_input         INTEGER NOT NULL DEFAULT 0,
    usage_output        INTEGER NOT NULL DEFAULT 0,
    rollover_baseline   INTEGER NOT NULL DEFAULT 0,
    rollover_count      INTEGER NOT NULL DEFAULT 0,
    budget_ceiling      INTEGER NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('active','rolled','closed')),
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
