//! Domain model invariants: lifecycle transitions, budget arithmetic and
//! serialization names.

use callwarden::models::{
    AccountStatus, LedgerEventKind, SessionAccount, Usage, WorkItem, WorkStatus,
};

#[test]
fn work_item_transitions_follow_lifecycle() {
    use WorkStatus::{Completed, Failed, Queued, Running};

    assert!(Queued.can_transition_to(Running));
    assert!(Running.can_transition_to(Completed));
    assert!(Running.can_transition_to(Failed));
    assert!(Completed.can_transition_to(Queued));
    assert!(Failed.can_transition_to(Queued));

    assert!(!Queued.can_transition_to(Completed));
    assert!(!Completed.can_transition_to(Running));
    assert!(!Failed.can_transition_to(Completed));
    assert!(!Running.can_transition_to(Queued));
}

#[test]
fn terminal_statuses() {
    assert!(WorkStatus::Completed.is_terminal());
    assert!(WorkStatus::Failed.is_terminal());
    assert!(!WorkStatus::Queued.is_terminal());
    assert!(!WorkStatus::Running.is_terminal());
}

#[test]
fn running_item_gets_started_at() {
    let running = WorkItem::new(
        "debate-1".into(),
        "round-1".into(),
        "prompt".into(),
        0,
        WorkStatus::Running,
    );
    assert_eq!(running.started_at, Some(running.created_at));
    assert!(running.result.is_none());
    assert_eq!(running.retry_count, 0);

    let queued = WorkItem::new(
        "debate-1".into(),
        "round-2".into(),
        "prompt".into(),
        5,
        WorkStatus::Queued,
    );
    assert!(queued.started_at.is_none());
    assert_ne!(queued.id, running.id);
}

#[test]
fn usage_totals_and_saturates() {
    let mut usage = Usage::new(100, 20);
    assert_eq!(usage.total(), 120);

    usage += Usage::new(u64::MAX, 1);
    assert_eq!(usage.input_tokens, u64::MAX);
    assert_eq!(usage.output_tokens, 21);
    assert_eq!(usage.total(), u64::MAX);
}

#[test]
fn session_usage_is_measured_from_rollover_baseline() {
    let mut account = SessionAccount::new("acct".into(), 1_000);
    account.cumulative_usage = Usage::new(1_500, 300);
    assert!(account.over_budget());

    account.rollover_baseline = 1_800;
    assert_eq!(account.session_usage(), 0);
    assert!(!account.over_budget());

    account.cumulative_usage += Usage::new(900, 100);
    assert_eq!(account.session_usage(), 1_000);
    assert!(!account.over_budget(), "ceiling itself is within budget");
}

#[test]
fn account_transitions() {
    let mut account = SessionAccount::new("acct".into(), 10);
    assert_eq!(account.status, AccountStatus::Active);
    assert!(account.can_transition_to(AccountStatus::Rolled));
    assert!(account.can_transition_to(AccountStatus::Closed));

    account.status = AccountStatus::Rolled;
    assert!(account.can_transition_to(AccountStatus::Active));

    account.status = AccountStatus::Closed;
    assert!(!account.can_transition_to(AccountStatus::Active));
    assert!(!account.can_transition_to(AccountStatus::Rolled));
}

#[test]
fn storage_names_match_serde_names() {
    for status in [
        WorkStatus::Queued,
        WorkStatus::Running,
        WorkStatus::Completed,
        WorkStatus::Failed,
    ] {
        let json = serde_json::to_string(&status).expect("serialize");
        assert_eq!(json, format!("\"{}\"", status.as_str()));
    }

    let json = serde_json::to_string(&LedgerEventKind::StaleRecovered).expect("serialize");
    assert_eq!(json, "\"stale_recovered\"");
    assert_eq!(AccountStatus::Rolled.as_str(), "rolled");
}

#[test]
fn usage_deserializes_with_missing_fields() {
    let usage: Usage = serde_json::from_str(r#"{"output_tokens":7}"#).expect("deserialize");
    assert_eq!(usage, Usage::new(0, 7));
}
