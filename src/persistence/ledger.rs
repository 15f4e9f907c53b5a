//! Durable ledger of logical work items.
//!
//! The ledger is the single source of truth for work-item state. Its
//! guarantees come from the database, not from in-process locking:
//!
//! - a partial unique index on `(scope, logical_key)` over `queued` and
//!   `running` rows allows at most one in-flight attempt per key;
//! - every terminal write is a guarded `UPDATE ... WHERE status = 'running'`,
//!   so a late caller whose item was already reclaimed by a stale sweep
//!   (or completed by someone else) writes nothing;
//! - each transition appends to a per-scope event log in the same
//!   transaction, with sequence numbers unique per scope;
//! - staleness is measured from the owner's last [`touch`](Ledger::touch),
//!   so a long call with many retries is not reclaimed while its owner is
//!   alive.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};

use crate::models::{LedgerEvent, LedgerEventKind, Usage, WorkItem, WorkResult, WorkStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{format_ts, parse_opt_ts, parse_ts, to_i64, to_u64};

/// Repository for work items and their event log.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
    max_retries: u32,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    scope: String,
    logical_key: String,
    status: String,
    payload: String,
    priority: i64,
    result_text: Option<String>,
    usage_input: Option<i64>,
    usage_output: Option<i64>,
    continuation_token: Option<String>,
    duration_ms: Option<i64>,
    retry_count: i64,
    created_at: String,
    started_at: Option<String>,
    heartbeat_at: Option<String>,
    completed_at: Option<String>,
    error_text: Option<String>,
}

impl WorkItemRow {
    /// Convert a database row into the domain model.
    fn into_work_item(self) -> Result<WorkItem> {
        let status = parse_work_status(&self.status)?;
        let result = match self.result_text {
            Some(text) => Some(WorkResult {
                text,
                usage: Usage::new(
                    to_u64("usage_input", self.usage_input.unwrap_or(0))?,
                    to_u64("usage_output", self.usage_output.unwrap_or(0))?,
                ),
                continuation_token: self.continuation_token,
                duration_ms: to_u64("duration_ms", self.duration_ms.unwrap_or(0))?,
            }),
            None => None,
        };
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| AppError::Db(format!("invalid retry_count: {}", self.retry_count)))?;

        Ok(WorkItem {
            id: self.id,
            scope: self.scope,
            logical_key: self.logical_key,
            status,
            payload: self.payload,
            priority: self.priority,
            result,
            retry_count,
            created_at: parse_ts("created_at", &self.created_at)?,
            started_at: parse_opt_ts("started_at", self.started_at.as_deref())?,
            heartbeat_at: parse_opt_ts("heartbeat_at", self.heartbeat_at.as_deref())?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            error_text: self.error_text,
        })
    }
}

/// Internal row struct for the event log.
#[derive(sqlx::FromRow)]
struct EventRow {
    scope: String,
    seq: i64,
    work_item_id: String,
    kind: String,
    detail: Option<String>,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<LedgerEvent> {
        Ok(LedgerEvent {
            kind: parse_event_kind(&self.kind)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            scope: self.scope,
            seq: self.seq,
            work_item_id: self.work_item_id,
            detail: self.detail,
        })
    }
}

fn parse_work_status(s: &str) -> Result<WorkStatus> {
    match s {
        "queued" => Ok(WorkStatus::Queued),
        "running" => Ok(WorkStatus::Running),
        "completed" => Ok(WorkStatus::Completed),
        "failed" => Ok(WorkStatus::Failed),
        other => Err(AppError::Db(format!("invalid work item status: {other}"))),
    }
}

fn parse_event_kind(s: &str) -> Result<LedgerEventKind> {
    match s {
        "begun" => Ok(LedgerEventKind::Begun),
        "enqueued" => Ok(LedgerEventKind::Enqueued),
        "claimed" => Ok(LedgerEventKind::Claimed),
        "completed" => Ok(LedgerEventKind::Completed),
        "failed" => Ok(LedgerEventKind::Failed),
        "stale_recovered" => Ok(LedgerEventKind::StaleRecovered),
        "retried" => Ok(LedgerEventKind::Retried),
        other => Err(AppError::Db(format!("invalid ledger event kind: {other}"))),
    }
}

/// Map a unique-index violation on the active-key index to `Conflict`.
fn map_active_key_error(err: sqlx::Error, scope: &str, logical_key: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AppError::Conflict(
            format!("work item {scope}/{logical_key} is already queued or running"),
        ),
        _ => AppError::from(err),
    }
}

/// Append an event row with the next per-scope sequence number.
///
/// The counter lives in `scope_sequence` so numbering keeps increasing
/// even after retention purges old event rows.
async fn append_event(
    tx: &mut Transaction<'_, Sqlite>,
    scope: &str,
    work_item_id: &str,
    kind: LedgerEventKind,
    detail: Option<&str>,
) -> Result<()> {
    let seq: i64 = sqlx::query_scalar(
        "INSERT INTO scope_sequence (scope, last_seq) VALUES (?1, 1)
         ON CONFLICT(scope) DO UPDATE SET last_seq = last_seq + 1
         RETURNING last_seq",
    )
    .bind(scope)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO ledger_event (scope, seq, work_item_id, kind, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(scope)
    .bind(seq)
    .bind(work_item_id)
    .bind(kind.as_str())
    .bind(detail)
    .bind(format_ts(Utc::now()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl Ledger {
    /// Create a new ledger over the shared pool.
    ///
    /// `max_retries` bounds how many times [`retry`](Self::retry) may reset
    /// one item.
    #[must_use]
    pub fn new(db: Arc<Database>, max_retries: u32) -> Self {
        Self { db, max_retries }
    }

    /// Ceiling applied by [`retry`](Self::retry).
    #[must_use]
    pub fn retry_ceiling(&self) -> u32 {
        self.max_retries
    }

    /// Create a `running` work item for `(scope, logical_key)`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if a queued or running item already
    /// exists for the key, or `AppError::Db` on persistence failure.
    pub async fn begin(&self, scope: &str, logical_key: &str, payload: &str) -> Result<String> {
        let item = WorkItem::new(
            scope.to_owned(),
            logical_key.to_owned(),
            payload.to_owned(),
            0,
            WorkStatus::Running,
        );
        self.insert(&item, LedgerEventKind::Begun, false).await?;
        info!(scope, logical_key, item_id = item.id, "work item begun");
        Ok(item.id)
    }

    /// Like [`begin`](Self::begin), but also refuses while any other item
    /// of `scope` is running, so calls within one scope never overlap.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the key is queued or running or the
    /// scope is busy, or `AppError::Db` on persistence failure.
    pub async fn begin_sequential(
        &self,
        scope: &str,
        logical_key: &str,
        payload: &str,
    ) -> Result<String> {
        let item = WorkItem::new(
            scope.to_owned(),
            logical_key.to_owned(),
            payload.to_owned(),
            0,
            WorkStatus::Running,
        );
        self.insert(&item, LedgerEventKind::Begun, true).await?;
        info!(scope, logical_key, item_id = item.id, "work item begun");
        Ok(item.id)
    }

    /// Create a `queued` work item for later [`claim_next`](Self::claim_next).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if a queued or running item already
    /// exists for the key, or `AppError::Db` on persistence failure.
    pub async fn enqueue(
        &self,
        scope: &str,
        logical_key: &str,
        payload: &str,
        priority: i64,
    ) -> Result<String> {
        let item = WorkItem::new(
            scope.to_owned(),
            logical_key.to_owned(),
            payload.to_owned(),
            priority,
            WorkStatus::Queued,
        );
        self.insert(&item, LedgerEventKind::Enqueued, false).await?;
        info!(scope, logical_key, priority, item_id = item.id, "work item enqueued");
        Ok(item.id)
    }

    /// Insert `item`. With `exclusive_scope`, nothing is written while the
    /// scope has a running item.
    async fn insert(
        &self,
        item: &WorkItem,
        kind: LedgerEventKind,
        exclusive_scope: bool,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO work_item (id, scope, logical_key, status, payload, priority,
             retry_count, created_at, started_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
             WHERE ?10 = 0 OR NOT EXISTS (
                 SELECT 1 FROM work_item WHERE scope = ?2 AND status = 'running'
             )",
        )
        .bind(&item.id)
        .bind(&item.scope)
        .bind(&item.logical_key)
        .bind(item.status.as_str())
        .bind(&item.payload)
        .bind(item.priority)
        .bind(i64::from(item.retry_count))
        .bind(format_ts(item.created_at))
        .bind(item.started_at.map(format_ts))
        .bind(exclusive_scope)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_active_key_error(err, &item.scope, &item.logical_key))?
        .rows_affected();

        if inserted == 0 {
            debug!(scope = item.scope, "begin refused: scope has a running item");
            return Err(AppError::Conflict(format!(
                "scope {} already has a running work item",
                item.scope
            )));
        }

        append_event(&mut tx, &item.scope, &item.id, kind, None).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a successful result on a `running` item.
    ///
    /// Returns `false` and writes nothing when the item is not currently
    /// running (already completed, failed by a stale sweep, or unknown).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn complete(&self, item_id: &str, result: &WorkResult) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let scope: Option<String> = sqlx::query_scalar(
            "UPDATE work_item SET status = 'completed', result_text = ?1, usage_input = ?2,
             usage_output = ?3, continuation_token = ?4, duration_ms = ?5,
             completed_at = ?6, error_text = NULL
             WHERE id = ?7 AND status = 'running'
             RETURNING scope",
        )
        .bind(&result.text)
        .bind(to_i64("usage_input", result.usage.input_tokens)?)
        .bind(to_i64("usage_output", result.usage.output_tokens)?)
        .bind(&result.continuation_token)
        .bind(to_i64("duration_ms", result.duration_ms)?)
        .bind(format_ts(Utc::now()))
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(scope) = scope else {
            warn!(item_id, "complete refused: work item is not running");
            return Ok(false);
        };

        append_event(&mut tx, &scope, item_id, LedgerEventKind::Completed, None).await?;
        tx.commit().await?;
        info!(scope, item_id, duration_ms = result.duration_ms, "work item completed");
        Ok(true)
    }

    /// Record a failure on a `running` item.
    ///
    /// Same guard as [`complete`](Self::complete): returns `false` and
    /// writes nothing when the item is not running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn fail(&self, item_id: &str, error_text: &str) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let scope: Option<String> = sqlx::query_scalar(
            "UPDATE work_item SET status = 'failed', error_text = ?1, completed_at = ?2
             WHERE id = ?3 AND status = 'running'
             RETURNING scope",
        )
        .bind(error_text)
        .bind(format_ts(Utc::now()))
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(scope) = scope else {
            warn!(item_id, "fail refused: work item is not running");
            return Ok(false);
        };

        append_event(
            &mut tx,
            &scope,
            item_id,
            LedgerEventKind::Failed,
            Some(error_text),
        )
        .await?;
        tx.commit().await?;
        info!(scope, item_id, error = error_text, "work item failed");
        Ok(true)
    }

    /// Record that the owner of a `running` item is still alive.
    ///
    /// Returns `false` when the item is no longer running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn touch(&self, item_id: &str) -> Result<bool> {
        let touched = sqlx::query(
            "UPDATE work_item SET heartbeat_at = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(format_ts(Utc::now()))
        .bind(item_id)
        .execute(self.db.as_ref())
        .await?
        .rows_affected();
        Ok(touched > 0)
    }

    /// Fail every item in `scope` whose owner has been silent longer than
    /// `threshold`, measured from the last [`touch`](Self::touch) or, for
    /// an item never touched, from `started_at`. Returns the number of
    /// items reclaimed.
    ///
    /// Run by the next caller for the scope, never from a background task,
    /// and with a threshold of at least the process timeout plus a buffer so
    /// a live process is never raced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn recover_stale(&self, scope: &str, threshold: Duration) -> Result<u64> {
        let threshold_delta = chrono::Duration::from_std(threshold)
            .map_err(|e| AppError::Config(format!("stale threshold out of range: {e}")))?;
        let now = Utc::now();
        let cutoff = now - threshold_delta;
        let reason = format!(
            "stale: running longer than {}s without a terminal write",
            threshold.as_secs()
        );

        let mut tx = self.db.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE work_item SET status = 'failed', error_text = ?1, completed_at = ?2
             WHERE scope = ?3 AND status = 'running'
               AND COALESCE(heartbeat_at, started_at) < ?4
             RETURNING id",
        )
        .bind(&reason)
        .bind(format_ts(now))
        .bind(scope)
        .bind(format_ts(cutoff))
        .fetch_all(&mut *tx)
        .await?;

        for id in &ids {
            append_event(
                &mut tx,
                scope,
                id,
                LedgerEventKind::StaleRecovered,
                Some(&reason),
            )
            .await?;
        }
        tx.commit().await?;

        let count = ids.len() as u64;
        if count > 0 {
            warn!(scope, count, "recovered stale work items");
        } else {
            debug!(scope, "no stale work items");
        }
        Ok(count)
    }

    /// Reset a terminal item to `queued` and bump its retry count.
    ///
    /// Returns `false` when the item is not terminal or has already been
    /// retried [`retry_ceiling`](Self::retry_ceiling) times.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if another attempt for the same key is
    /// already queued or running, or `AppError::Db` on persistence failure.
    pub async fn retry(&self, item_id: &str) -> Result<bool> {
        let Some(item) = self.get(item_id).await? else {
            return Ok(false);
        };

        let mut tx = self.db.begin().await?;
        let retried: Option<i64> = sqlx::query_scalar(
            "UPDATE work_item SET status = 'queued', retry_count = retry_count + 1,
             started_at = NULL, heartbeat_at = NULL, completed_at = NULL, result_text = NULL,
             usage_input = NULL, usage_output = NULL, continuation_token = NULL,
             duration_ms = NULL, error_text = NULL
             WHERE id = ?1 AND status IN ('completed', 'failed') AND retry_count < ?2
             RETURNING retry_count",
        )
        .bind(item_id)
        .bind(i64::from(self.max_retries))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| map_active_key_error(err, &item.scope, &item.logical_key))?;

        let Some(retry_count) = retried else {
            debug!(
                item_id,
                status = item.status.as_str(),
                retry_count = item.retry_count,
                "retry refused"
            );
            return Ok(false);
        };

        let detail = format!("retry {retry_count}/{}", self.max_retries);
        append_event(
            &mut tx,
            &item.scope,
            item_id,
            LedgerEventKind::Retried,
            Some(&detail),
        )
        .await?;
        tx.commit().await?;
        info!(scope = item.scope, item_id, retry_count, "work item requeued");
        Ok(true)
    }

    /// Atomically claim the next queued item and mark it `running`.
    ///
    /// Selection order is ascending priority, then ascending creation time,
    /// then insertion order. Scopes that already have a running item are
    /// skipped so calls within one scope stay sequential.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn claim_next(&self, scope: Option<&str>) -> Result<Option<WorkItem>> {
        let mut tx = self.db.begin().await?;
        let row: Option<WorkItemRow> = sqlx::query_as(
            "UPDATE work_item SET status = 'running', started_at = ?1, heartbeat_at = NULL
             WHERE id = (
                 SELECT w.id FROM work_item w
                 WHERE w.status = 'queued'
                   AND (?2 IS NULL OR w.scope = ?2)
                   AND NOT EXISTS (
                       SELECT 1 FROM work_item r
                       WHERE r.scope = w.scope AND r.status = 'running'
                   )
                 ORDER BY w.priority ASC, w.created_at ASC, w.rowid ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(format_ts(Utc::now()))
        .bind(scope)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let item = row.into_work_item()?;

        append_event(&mut tx, &item.scope, &item.id, LedgerEventKind::Claimed, None).await?;
        tx.commit().await?;
        info!(
            scope = item.scope,
            item_id = item.id,
            priority = item.priority,
            "work item claimed"
        );
        Ok(Some(item))
    }

    /// Retrieve a work item by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, item_id: &str) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as("SELECT * FROM work_item WHERE id = ?1")
            .bind(item_id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(WorkItemRow::into_work_item).transpose()
    }

    /// Retrieve the queued or running item for a key, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_active(&self, scope: &str, logical_key: &str) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(
            "SELECT * FROM work_item \
             WHERE scope = ?1 AND logical_key = ?2 AND status IN ('queued', 'running') LIMIT 1",
        )
        .bind(scope)
        .bind(logical_key)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(WorkItemRow::into_work_item).transpose()
    }

    /// List every item in a scope in creation order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, scope: &str) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT * FROM work_item WHERE scope = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(scope)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(WorkItemRow::into_work_item).collect()
    }

    /// The most recent `limit` completed items of a scope, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn history(&self, scope: &str, limit: u32) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT * FROM work_item WHERE scope = ?1 AND status = 'completed' \
             ORDER BY completed_at DESC, rowid DESC LIMIT ?2",
        )
        .bind(scope)
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;

        let mut items = rows
            .into_iter()
            .map(WorkItemRow::into_work_item)
            .collect::<Result<Vec<_>>>()?;
        items.reverse();
        Ok(items)
    }

    /// The append-only event log of a scope in sequence order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn events(&self, scope: &str) -> Result<Vec<LedgerEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT scope, seq, work_item_id, kind, detail, created_at \
             FROM ledger_event WHERE scope = ?1 ORDER BY seq ASC",
        )
        .bind(scope)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }
}
