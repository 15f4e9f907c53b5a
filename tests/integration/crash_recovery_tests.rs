//! Crash recovery against an on-disk database.
//!
//! Validates:
//! - a `running` item left by a crashed caller survives a restart and
//!   keeps blocking its key
//! - the next caller's stale sweep fails it and frees the key
//! - the event log and sequence counter persist across restarts

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use callwarden::models::{LedgerEventKind, WorkStatus};
use callwarden::persistence::db;
use callwarden::persistence::ledger::Ledger;
use callwarden::AppError;

#[tokio::test]
async fn orphaned_item_is_recovered_after_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("state").join("ledger.db");

    // ── First process: begin, then "crash" ───────────────
    let orphan = {
        let pool = Arc::new(db::connect(&path).await.expect("connect"));
        let ledger = Ledger::new(Arc::clone(&pool), 3);
        let id = ledger
            .begin("debate", "round-1", "argue")
            .await
            .expect("begin");

        let crashed_at = Utc::now() - chrono::Duration::minutes(30);
        sqlx::query("UPDATE work_item SET started_at = ?1 WHERE id = ?2")
            .bind(crashed_at.to_rfc3339_opts(SecondsFormat::Micros, true))
            .bind(&id)
            .execute(pool.as_ref())
            .await
            .expect("backdate");
        pool.close().await;
        id
    };

    // ── Second process ───────────────────────────────────
    let pool = Arc::new(db::connect(&path).await.expect("reconnect"));
    let ledger = Ledger::new(Arc::clone(&pool), 3);

    let item = ledger.get(&orphan).await.expect("get").expect("persisted");
    assert_eq!(item.status, WorkStatus::Running);

    let err = ledger
        .begin("debate", "round-1", "argue again")
        .await
        .expect_err("still blocked");
    assert!(matches!(err, AppError::Conflict(_)));

    // A threshold longer than the item's age leaves it alone.
    assert_eq!(
        ledger
            .recover_stale("debate", Duration::from_secs(3_600))
            .await
            .expect("recover"),
        0
    );
    assert_eq!(
        ledger
            .recover_stale("debate", Duration::from_secs(600))
            .await
            .expect("recover"),
        1
    );

    let fresh = ledger
        .begin("debate", "round-1", "argue again")
        .await
        .expect("begin after recovery");
    assert_ne!(fresh, orphan);

    let events = ledger.events("debate").await.expect("events");
    let kinds: Vec<LedgerEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LedgerEventKind::Begun,
            LedgerEventKind::StaleRecovered,
            LedgerEventKind::Begun,
        ]
    );
    assert_eq!(
        events.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    pool.close().await;
}

#[tokio::test]
async fn completed_results_survive_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("ledger.db");

    let id = {
        let pool = Arc::new(db::connect(&path).await.expect("connect"));
        let ledger = Ledger::new(Arc::clone(&pool), 3);
        let id = ledger.begin("s", "k", "p").await.expect("begin");
        ledger
            .complete(
                &id,
                &callwarden::models::WorkResult {
                    text: "durable answer".into(),
                    usage: callwarden::models::Usage::new(3, 4),
                    continuation_token: Some("sess".into()),
                    duration_ms: 12,
                },
            )
            .await
            .expect("complete");
        pool.close().await;
        id
    };

    let pool = Arc::new(db::connect(&path).await.expect("reconnect"));
    let ledger = Ledger::new(Arc::clone(&pool), 3);
    let item = ledger.get(&id).await.expect("get").expect("persisted");
    assert_eq!(item.status, WorkStatus::Completed);
    assert_eq!(
        item.result.map(|r| r.text).as_deref(),
        Some("durable answer")
    );
    pool.close().await;
}
