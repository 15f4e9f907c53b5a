//! Work-item ledger: idempotent begin, guarded terminal writes, stale
//! recovery, explicit retry, queue claims and the per-scope event log.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use callwarden::models::{LedgerEventKind, Usage, WorkResult, WorkStatus};
use callwarden::persistence::db::{self, Database};
use callwarden::persistence::ledger::Ledger;
use callwarden::AppError;

async fn setup(max_retries: u32) -> (Arc<Database>, Ledger) {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let ledger = Ledger::new(Arc::clone(&db), max_retries);
    (db, ledger)
}

fn result(text: &str) -> WorkResult {
    WorkResult {
        text: text.to_owned(),
        usage: Usage::new(12, 3),
        continuation_token: Some("sess-1".into()),
        duration_ms: 42,
    }
}

async fn backdate(db: &Database, item_id: &str, age: Duration) {
    let started = Utc::now() - chrono::Duration::from_std(age).expect("duration");
    sqlx::query("UPDATE work_item SET started_at = ?1 WHERE id = ?2")
        .bind(started.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(item_id)
        .execute(db)
        .await
        .expect("backdate");
}

#[tokio::test]
async fn begin_creates_running_item() {
    let (_db, ledger) = setup(3).await;
    let id = ledger.begin("debate", "round-1", "argue").await.expect("begin");

    let item = ledger.get(&id).await.expect("get").expect("exists");
    assert_eq!(item.status, WorkStatus::Running);
    assert_eq!(item.payload, "argue");
    assert!(item.started_at.is_some());
    assert!(item.result.is_none());
}

#[tokio::test]
async fn second_begin_for_active_key_conflicts() {
    let (_db, ledger) = setup(3).await;
    ledger.begin("debate", "round-1", "a").await.expect("begin");

    let err = ledger
        .begin("debate", "round-1", "b")
        .await
        .expect_err("conflict");
    assert!(matches!(err, AppError::Conflict(_)));

    // Same key in another scope is independent.
    ledger.begin("other", "round-1", "c").await.expect("begin");
}

#[tokio::test]
async fn concurrent_begins_admit_exactly_one() {
    let (_db, ledger) = setup(3).await;

    let mut handles = Vec::new();
    for n in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.begin("race", "key", &format!("payload {n}")).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => ok += 1,
            Err(AppError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(ledger.list("race").await.expect("list").len(), 1);
}

#[tokio::test]
async fn terminal_item_does_not_block_new_begin() {
    let (_db, ledger) = setup(3).await;
    let first = ledger.begin("s", "k", "p").await.expect("begin");
    assert!(ledger.complete(&first, &result("done")).await.expect("complete"));

    let second = ledger.begin("s", "k", "p").await.expect("begin after completion");
    assert_ne!(first, second);
}

#[tokio::test]
async fn complete_stores_result_once() {
    let (_db, ledger) = setup(3).await;
    let id = ledger.begin("s", "k", "p").await.expect("begin");

    assert!(ledger.complete(&id, &result("first")).await.expect("complete"));
    assert!(!ledger.complete(&id, &result("second")).await.expect("complete"));
    assert!(!ledger.fail(&id, "late failure").await.expect("fail"));

    let item = ledger.get(&id).await.expect("get").expect("exists");
    assert_eq!(item.status, WorkStatus::Completed);
    assert_eq!(item.result, Some(result("first")));
    assert!(item.completed_at.is_some());
    assert!(item.error_text.is_none());
}

#[tokio::test]
async fn fail_records_error_text() {
    let (_db, ledger) = setup(3).await;
    let id = ledger.begin("s", "k", "p").await.expect("begin");

    assert!(ledger.fail(&id, "exit code 2").await.expect("fail"));
    let item = ledger.get(&id).await.expect("get").expect("exists");
    assert_eq!(item.status, WorkStatus::Failed);
    assert_eq!(item.error_text.as_deref(), Some("exit code 2"));
}

#[tokio::test]
async fn unknown_item_writes_nothing() {
    let (_db, ledger) = setup(3).await;
    assert!(!ledger.complete("missing", &result("x")).await.expect("complete"));
    assert!(!ledger.fail("missing", "x").await.expect("fail"));
    assert!(!ledger.retry("missing").await.expect("retry"));
}

#[tokio::test]
async fn stale_items_are_reclaimed_and_late_completion_refused() {
    let (db, ledger) = setup(3).await;
    let stale = ledger.begin("s", "stale", "p").await.expect("begin");
    let fresh = ledger.begin("s", "fresh", "p").await.expect("begin");
    let elsewhere = ledger.begin("other", "stale", "p").await.expect("begin");
    backdate(&db, &stale, Duration::from_secs(7_200)).await;
    backdate(&db, &elsewhere, Duration::from_secs(7_200)).await;

    let recovered = ledger
        .recover_stale("s", Duration::from_secs(60))
        .await
        .expect("recover");
    assert_eq!(recovered, 1);

    let item = ledger.get(&stale).await.expect("get").expect("exists");
    assert_eq!(item.status, WorkStatus::Failed);
    assert!(item.error_text.as_deref().is_some_and(|e| e.starts_with("stale")));

    let fresh_item = ledger.get(&fresh).await.expect("get").expect("exists");
    assert_eq!(fresh_item.status, WorkStatus::Running);
    let other = ledger.get(&elsewhere).await.expect("get").expect("exists");
    assert_eq!(other.status, WorkStatus::Running);

    // The reclaimed caller's late result is dropped.
    assert!(!ledger.complete(&stale, &result("late")).await.expect("complete"));
    // And the key is free again.
    ledger.begin("s", "stale", "p").await.expect("begin after recovery");
}

#[tokio::test]
async fn touched_item_survives_sweep_despite_old_start() {
    let (db, ledger) = setup(3).await;
    let live = ledger.begin("s", "live", "p").await.expect("begin");
    let silent = ledger.begin("s", "silent", "p").await.expect("begin");
    backdate(&db, &live, Duration::from_secs(7_200)).await;
    backdate(&db, &silent, Duration::from_secs(7_200)).await;

    assert!(ledger.touch(&live).await.expect("touch"));

    let recovered = ledger
        .recover_stale("s", Duration::from_secs(60))
        .await
        .expect("recover");
    assert_eq!(recovered, 1);

    let live_item = ledger.get(&live).await.expect("get").expect("exists");
    assert_eq!(live_item.status, WorkStatus::Running);
    assert!(live_item.heartbeat_at.is_some());
    let silent_item = ledger.get(&silent).await.expect("get").expect("exists");
    assert_eq!(silent_item.status, WorkStatus::Failed);

    // Terminal items are not touched.
    assert!(!ledger.touch(&silent).await.expect("touch failed item"));
}

#[tokio::test]
async fn sequential_begin_waits_for_running_item_in_scope() {
    let (_db, ledger) = setup(3).await;
    let first = ledger
        .begin_sequential("debate", "round-1", "p")
        .await
        .expect("begin");

    let err = ledger
        .begin_sequential("debate", "round-2", "p")
        .await
        .expect_err("scope busy");
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(ledger.list("debate").await.expect("list").len(), 1);

    // Other scopes and queued items do not block.
    ledger
        .begin_sequential("other", "round-1", "p")
        .await
        .expect("other scope");
    ledger
        .enqueue("debate", "later", "p", 0)
        .await
        .expect("enqueue while running");

    ledger.complete(&first, &result("done")).await.expect("complete");
    ledger
        .begin_sequential("debate", "round-2", "p")
        .await
        .expect("begin after completion");
}

#[tokio::test]
async fn retry_requeues_terminal_item_up_to_ceiling() {
    let (_db, ledger) = setup(1).await;
    let id = ledger.begin("s", "k", "p").await.expect("begin");

    assert!(!ledger.retry(&id).await.expect("retry running"));

    ledger.fail(&id, "boom").await.expect("fail");
    assert!(ledger.retry(&id).await.expect("retry"));

    let item = ledger.get(&id).await.expect("get").expect("exists");
    assert_eq!(item.status, WorkStatus::Queued);
    assert_eq!(item.retry_count, 1);
    assert!(item.error_text.is_none());
    assert!(item.started_at.is_none());

    let claimed = ledger.claim_next(Some("s")).await.expect("claim").expect("item");
    assert_eq!(claimed.id, id);
    ledger.fail(&id, "boom again").await.expect("fail");

    assert!(!ledger.retry(&id).await.expect("retry past ceiling"));
    assert_eq!(ledger.retry_ceiling(), 1);
}

#[tokio::test]
async fn retry_conflicts_with_newer_active_attempt() {
    let (_db, ledger) = setup(3).await;
    let old = ledger.begin("s", "k", "p").await.expect("begin");
    ledger.fail(&old, "boom").await.expect("fail");
    ledger.begin("s", "k", "p").await.expect("new attempt");

    let err = ledger.retry(&old).await.expect_err("conflict");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn claim_next_orders_by_priority_and_serializes_scope() {
    let (_db, ledger) = setup(3).await;
    ledger.enqueue("s", "low", "p", 5).await.expect("enqueue");
    ledger.enqueue("s", "high-a", "p", 1).await.expect("enqueue");
    ledger.enqueue("s", "high-b", "p", 1).await.expect("enqueue");

    let first = ledger.claim_next(None).await.expect("claim").expect("item");
    assert_eq!(first.logical_key, "high-a");
    assert_eq!(first.status, WorkStatus::Running);
    assert!(first.started_at.is_some());

    // Scope already has a running item.
    assert!(ledger.claim_next(None).await.expect("claim").is_none());

    ledger.complete(&first.id, &result("a")).await.expect("complete");
    let second = ledger.claim_next(None).await.expect("claim").expect("item");
    assert_eq!(second.logical_key, "high-b");

    ledger.complete(&second.id, &result("b")).await.expect("complete");
    let third = ledger.claim_next(None).await.expect("claim").expect("item");
    assert_eq!(third.logical_key, "low");
}

#[tokio::test]
async fn claim_next_respects_scope_filter() {
    let (_db, ledger) = setup(3).await;
    ledger.enqueue("alpha", "k", "p", 0).await.expect("enqueue");
    ledger.enqueue("beta", "k", "p", 0).await.expect("enqueue");

    let item = ledger
        .claim_next(Some("beta"))
        .await
        .expect("claim")
        .expect("item");
    assert_eq!(item.scope, "beta");

    let other = ledger.claim_next(None).await.expect("claim").expect("item");
    assert_eq!(other.scope, "alpha");
    assert!(ledger.claim_next(None).await.expect("claim").is_none());
}

#[tokio::test]
async fn enqueue_conflicts_with_running_key() {
    let (_db, ledger) = setup(3).await;
    ledger.begin("s", "k", "p").await.expect("begin");
    let err = ledger.enqueue("s", "k", "p", 0).await.expect_err("conflict");
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(ledger.find_active("s", "k").await.expect("find").is_some());
    assert!(ledger.find_active("s", "missing").await.expect("find").is_none());
}

#[tokio::test]
async fn event_sequence_is_contiguous_per_scope() {
    let (_db, ledger) = setup(3).await;
    let a = ledger.begin("s", "a", "p").await.expect("begin");
    ledger.begin("other", "a", "p").await.expect("begin");
    ledger.complete(&a, &result("ok")).await.expect("complete");
    let b = ledger.enqueue("s", "b", "p", 0).await.expect("enqueue");
    ledger.claim_next(Some("s")).await.expect("claim");
    ledger.fail(&b, "boom").await.expect("fail");
    ledger.retry(&b).await.expect("retry");

    let events = ledger.events("s").await.expect("events");
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);

    let kinds: Vec<LedgerEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LedgerEventKind::Begun,
            LedgerEventKind::Completed,
            LedgerEventKind::Enqueued,
            LedgerEventKind::Claimed,
            LedgerEventKind::Failed,
            LedgerEventKind::Retried,
        ]
    );
    assert_eq!(events[4].detail.as_deref(), Some("boom"));
    assert_eq!(events[5].detail.as_deref(), Some("retry 1/3"));

    let other = ledger.events("other").await.expect("events");
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].seq, 1);
}

#[tokio::test]
async fn history_returns_latest_completions_oldest_first() {
    let (_db, ledger) = setup(3).await;
    for key in ["one", "two", "three"] {
        let id = ledger.begin("s", key, key).await.expect("begin");
        ledger.complete(&id, &result(key)).await.expect("complete");
    }
    let failed = ledger.begin("s", "four", "p").await.expect("begin");
    ledger.fail(&failed, "boom").await.expect("fail");

    let history = ledger.history("s", 2).await.expect("history");
    let keys: Vec<&str> = history.iter().map(|i| i.logical_key.as_str()).collect();
    assert_eq!(keys, vec!["two", "three"]);
}
