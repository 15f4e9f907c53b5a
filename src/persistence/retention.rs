//! Retention service for time-based ledger purge.
//!
//! Runs as a background task deleting the event rows of expired work
//! items first, then the terminal work items themselves, once they have
//! been completed or failed for longer than `retention_days`. Queued and
//! running items are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use super::format_ts;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly, the first pass immediately.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge_expired(&db, retention_days).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete terminal work items (and their events) older than the window.
///
/// Returns the number of work items removed.
///
/// # Errors
///
/// Returns `AppError::Db` if any delete fails.
pub async fn purge_expired(db: &Database, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let cutoff_str = format_ts(cutoff);

    let mut tx = db.begin().await?;

    // Children first.
    sqlx::query(
        "DELETE FROM ledger_event WHERE work_item_id IN \
         (SELECT id FROM work_item \
          WHERE status IN ('completed', 'failed') AND completed_at < ?1)",
    )
    .bind(&cutoff_str)
    .execute(&mut *tx)
    .await?;

    let removed = sqlx::query(
        "DELETE FROM work_item \
         WHERE status IN ('completed', 'failed') AND completed_at < ?1",
    )
    .bind(&cutoff_str)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    info!(retention_days, removed, "retention purge completed");
    Ok(removed)
}
