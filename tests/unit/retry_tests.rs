//! Retry loop: classification, ceilings, budget, observer isolation and
//! cancellation. Runs on paused time so backoff sleeps cost nothing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use callwarden::config::RetryConfig;
use callwarden::orchestrator::retry::{
    classify, classify_process, ErrorClass, FixedJitter, RetryNotice, RetryObserver,
    RetryOptions, RetryPolicy,
};
use callwarden::process::{ProcessError, ProcessErrorKind};
use callwarden::{AppError, Result};

fn policy(base_ms: u64, margin_ms: u64) -> RetryPolicy {
    let config = RetryConfig {
        base_delay_ms: base_ms,
        max_delay_ms: 60_000,
        jitter_ms: 0,
        rate_limit_max_delay_ms: 5_000,
        min_budget_margin_ms: margin_ms,
        ..RetryConfig::default()
    };
    RetryPolicy::from_config(&config).with_jitter_source(Arc::new(FixedJitter(Duration::ZERO)))
}

fn options(max_retries: u32, total_attempts: u32) -> RetryOptions {
    RetryOptions {
        max_retries,
        total_attempts,
        per_call_timeout: None,
        time_budget: None,
        cancel: None,
    }
}

fn exit_error(status: Option<u16>, message: &str) -> ProcessError {
    let mut err = ProcessError::new(
        ProcessErrorKind::NonZeroExit,
        message,
        Duration::from_millis(5),
    );
    err.exit_code = Some(1);
    err.status = status;
    err
}

fn failing(status: Option<u16>, message: &str) -> Result<&'static str> {
    Err(AppError::Process(exit_error(status, message)))
}

// ── Classification ───────────────────────────────────────────────────────────

#[test]
fn status_signal_drives_classification() {
    let mut limited = exit_error(Some(429), "anything");
    limited.retry_after = Some(Duration::from_secs(2));
    assert_eq!(
        classify_process(&limited),
        ErrorClass::RateLimited {
            retry_after: Some(Duration::from_secs(2))
        }
    );
    assert_eq!(
        classify_process(&exit_error(Some(503), "")),
        ErrorClass::Transient
    );
    assert_eq!(
        classify_process(&exit_error(Some(408), "")),
        ErrorClass::Transient
    );
    assert_eq!(
        classify_process(&exit_error(Some(400), "rate limit")),
        ErrorClass::Fatal
    );
}

#[test]
fn message_is_matched_without_status() {
    assert_eq!(
        classify_process(&exit_error(None, "Too Many Requests")),
        ErrorClass::RateLimited { retry_after: None }
    );
    assert_eq!(
        classify_process(&exit_error(None, "upstream connection reset by peer")),
        ErrorClass::Transient
    );
    assert_eq!(
        classify_process(&exit_error(None, "invalid argument --frobnicate")),
        ErrorClass::Fatal
    );
}

#[test]
fn stderr_does_not_influence_classification() {
    let mut err = exit_error(None, "process failed with exit code 1");
    err.stderr_tail = "HTTP 429 rate limited".into();
    assert_eq!(classify_process(&err), ErrorClass::Fatal);
}

#[test]
fn timeouts_are_transient_and_others_fatal() {
    let timeout = ProcessError::new(ProcessErrorKind::Timeout, "slow", Duration::ZERO);
    let idle = ProcessError::new(ProcessErrorKind::IdleTimeout, "quiet", Duration::ZERO);
    let spawn = ProcessError::new(ProcessErrorKind::SpawnFailed, "missing", Duration::ZERO);
    assert_eq!(classify_process(&timeout), ErrorClass::Transient);
    assert_eq!(classify_process(&idle), ErrorClass::Transient);
    assert_eq!(classify_process(&spawn), ErrorClass::Fatal);
    assert_eq!(classify(&AppError::Db("locked".into())), ErrorClass::Fatal);
}

// ── Loop behaviour ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rate_limit_does_not_consume_a_retry() {
    let outcome = policy(100, 0)
        .with_retry(
            &options(0, 5),
            |attempt| async move {
                if attempt == 1 {
                    let mut err = exit_error(Some(429), "slow down");
                    err.retry_after = Some(Duration::from_millis(250));
                    Err(AppError::Process(err))
                } else {
                    Ok("done")
                }
            },
            None,
        )
        .await;

    assert_eq!(outcome.result.expect("succeeds"), "done");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_retries() {
    let outcome = policy(100, 0)
        .with_retry(&options(2, 10), |_| async { failing(Some(503), "unavailable") }, None)
        .await;

    let err = outcome.result.expect_err("exhausted");
    assert_eq!(err.as_process().map(|p| p.status), Some(Some(503)));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn transient_then_success_counts_one_retry() {
    let outcome = policy(100, 0)
        .with_retry(
            &options(3, 10),
            |attempt| async move {
                if attempt < 2 {
                    failing(None, "bad gateway")
                } else {
                    Ok("ok")
                }
            },
            None,
        )
        .await;

    assert!(outcome.result.is_ok());
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_is_not_retried() {
    let calls = AtomicU32::new(0);
    let outcome = policy(100, 0)
        .with_retry(
            &options(5, 10),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { failing(Some(400), "bad request") }
            },
            None,
        )
        .await;

    assert!(outcome.result.is_err());
    assert_eq!(outcome.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn total_attempts_caps_rate_limited_loops() {
    let outcome = policy(10, 0)
        .with_retry(&options(0, 4), |_| async { failing(Some(429), "") }, None)
        .await;

    assert!(outcome.result.is_err());
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_delay_is_clamped() {
    let started = tokio::time::Instant::now();
    let outcome = policy(10, 0)
        .with_retry(
            &options(0, 2),
            |attempt| async move {
                if attempt == 1 {
                    let mut err = exit_error(Some(429), "");
                    err.retry_after = Some(Duration::from_secs(3_600));
                    Err(AppError::Process(err))
                } else {
                    Ok(())
                }
            },
            None,
        )
        .await;

    assert!(outcome.result.is_ok());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5));
    assert!(waited < Duration::from_secs(6), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn budget_exhaustion_stops_before_sleeping() {
    let mut opts = options(5, 10);
    opts.time_budget = Some(Duration::from_secs(1));

    let outcome = policy(400, 100)
        .with_retry(&opts, |_| async { failing(Some(503), "") }, None)
        .await;

    assert!(matches!(outcome.result, Err(AppError::BudgetExhausted(_))));
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn budget_exhaustion_keeps_the_causing_error() {
    let mut opts = options(5, 10);
    opts.time_budget = Some(Duration::from_secs(1));

    let outcome = policy(400, 100)
        .with_retry(
            &opts,
            |_| async { failing(Some(503), "upstream service unavailable") },
            None,
        )
        .await;

    let Err(AppError::BudgetExhausted(message)) = outcome.result else {
        panic!("expected budget exhaustion");
    };
    assert!(message.contains("last error"), "{message}");
    assert!(message.contains("upstream service unavailable"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn per_call_timeout_bounds_each_attempt() {
    let mut opts = options(0, 3);
    opts.per_call_timeout = Some(Duration::from_millis(100));

    let outcome = policy(10, 0)
        .with_retry(
            &opts,
            |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            None,
        )
        .await;

    let err = outcome.result.expect_err("timed out");
    assert_eq!(
        err.as_process().map(|p| p.kind),
        Some(ProcessErrorKind::Timeout)
    );
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn observer_sees_each_retry_and_failures_are_ignored() {
    let seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    let observer: Box<RetryObserver> = Box::new(move |notice: &RetryNotice<'_>| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(notice.class, ErrorClass::Transient);
        if n == 0 {
            panic!("observer blew up");
        }
        Err::<(), _>(AppError::Io("observer sink closed".into()))
    });

    let outcome = policy(10, 0)
        .with_retry(
            &options(3, 10),
            |attempt| async move {
                if attempt <= 2 {
                    failing(Some(502), "")
                } else {
                    Ok("ok")
                }
            },
            Some(observer.as_ref()),
        )
        .await;

    assert_eq!(outcome.result.expect("succeeds"), "ok");
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let opts = options(5, 10).with_cancel(cancel);
    let started = tokio::time::Instant::now();
    let outcome = policy(10_000, 0)
        .with_retry(&opts, |_| async { failing(Some(503), "") }, None)
        .await;

    assert!(matches!(outcome.result, Err(AppError::Cancelled(_))));
    assert_eq!(outcome.attempts, 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn cancelled_token_prevents_first_attempt() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let opts = options(1, 3).with_cancel(cancel);

    let outcome = policy(10, 0)
        .with_retry(&opts, |_| async { Ok(()) }, None)
        .await;

    assert!(matches!(outcome.result, Err(AppError::Cancelled(_))));
    assert_eq!(outcome.attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_attempt_is_returned_as_is() {
    let outcome = policy(10, 0)
        .with_retry(
            &options(3, 10),
            |_| async {
                Err::<(), _>(AppError::Process(ProcessError::new(
                    ProcessErrorKind::Cancelled,
                    "cancelled after 3ms",
                    Duration::from_millis(3),
                )))
            },
            None,
        )
        .await;

    assert!(outcome.result.expect_err("cancelled").is_cancelled());
    assert_eq!(outcome.attempts, 1);
}
