//! Error classification and retry with backoff.
//!
//! Three classes drive the loop:
//!
//! - **rate-limited**: waits the server-suggested delay (clamped) or an
//!   exponential backoff, and does not consume a retry slot;
//! - **transient**: exponential backoff with jitter, one retry slot each;
//! - **fatal**: returned immediately.
//!
//! `total_attempts` caps every attempt regardless of class. Resume logic
//! lives in [`super::resume`], never here.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::process::{ProcessError, ProcessErrorKind};
use crate::{AppError, Result};

/// Status signal that marks a rate-limited response.
pub const RATE_LIMIT_STATUS: u16 = 429;

#[allow(clippy::expect_used)]
static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(429|rate[ _-]?limit(ed)?|too many requests)\b").expect("hardcoded regex")
});

#[allow(clippy::expect_used)]
static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(5\d\d|connection (reset|refused|closed)|timed out|econnreset|econnrefused|etimedout|service unavailable|bad gateway|overloaded)\b",
    )
    .expect("hardcoded regex")
});

// ── Classification ───────────────────────────────────────────────────────────

/// How the retry loop treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Flow control; wait and retry without consuming a retry slot.
    RateLimited {
        /// Server-suggested delay, if any.
        retry_after: Option<Duration>,
    },
    /// Likely to succeed on retry.
    Transient,
    /// Retrying cannot help.
    Fatal,
}

impl ErrorClass {
    /// Stable name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

/// Classify an error for the retry loop.
///
/// Only process failures are retryable. The structured status signal wins
/// over message matching; stderr is never consulted.
#[must_use]
pub fn classify(err: &AppError) -> ErrorClass {
    match err {
        AppError::Process(process) => classify_process(process),
        _ => ErrorClass::Fatal,
    }
}

/// Classify a process failure.
#[must_use]
pub fn classify_process(err: &ProcessError) -> ErrorClass {
    match err.kind {
        ProcessErrorKind::Timeout | ProcessErrorKind::IdleTimeout => ErrorClass::Transient,
        ProcessErrorKind::NonZeroExit => match err.status {
            Some(RATE_LIMIT_STATUS) => ErrorClass::RateLimited {
                retry_after: err.retry_after,
            },
            Some(408 | 500..=599) => ErrorClass::Transient,
            Some(_) => ErrorClass::Fatal,
            None if RATE_LIMIT_PATTERN.is_match(&err.message) => ErrorClass::RateLimited {
                retry_after: err.retry_after,
            },
            None if TRANSIENT_PATTERN.is_match(&err.message) => ErrorClass::Transient,
            None => ErrorClass::Fatal,
        },
        ProcessErrorKind::SpawnFailed
        | ProcessErrorKind::OutputTooLarge
        | ProcessErrorKind::Cancelled
        | ProcessErrorKind::Io => ErrorClass::Fatal,
    }
}

// ── Backoff ──────────────────────────────────────────────────────────────────

/// Source of the random jitter added to each backoff delay.
pub trait JitterSource: Send + Sync {
    /// A delay in `[0, max]`.
    fn jitter(&self, max: Duration) -> Duration;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, max: Duration) -> Duration {
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Constant jitter, clamped to the maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedJitter(pub Duration);

impl JitterSource for FixedJitter {
    fn jitter(&self, max: Duration) -> Duration {
        self.0.min(max)
    }
}

/// Exponential backoff: `min(base * 2^n, cap) + jitter(0, jitter_max)`.
#[derive(Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter_max: Duration,
    jitter: Arc<dyn JitterSource>,
}

impl Backoff {
    /// Backoff with random jitter.
    #[must_use]
    pub fn new(base: Duration, cap: Duration, jitter_max: Duration) -> Self {
        Self {
            base,
            cap,
            jitter_max,
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Replace the jitter source.
    #[must_use]
    pub fn with_jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `n` (zero-based).
    #[must_use]
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n);
        let exponential = self.base.saturating_mul(factor).min(self.cap);
        exponential + self.jitter.jitter(self.jitter_max)
    }

    /// Upper bound of the exponential term.
    #[must_use]
    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("base", &self.base)
            .field("cap", &self.cap)
            .field("jitter_max", &self.jitter_max)
            .finish_non_exhaustive()
    }
}

// ── Retry loop ───────────────────────────────────────────────────────────────

/// One attempt inside the retry loop. Never persisted.
#[derive(Debug, Clone, Copy)]
pub struct CallAttempt {
    /// 1-based attempt number.
    pub number: u32,
    /// When the attempt started.
    pub started_at: Instant,
    /// Classification of the attempt's failure, once known.
    pub class: Option<ErrorClass>,
}

/// Passed to the retry observer before each backoff sleep.
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// The attempt that just failed.
    pub attempt: CallAttempt,
    /// Its error.
    pub error: &'a AppError,
    /// Delay before the next attempt.
    pub delay: Duration,
    /// How the error was classified.
    pub class: ErrorClass,
}

/// Telemetry hook; its errors and panics are logged and ignored.
pub type RetryObserver = dyn Fn(&RetryNotice<'_>) -> Result<()> + Send + Sync;

/// Per-invocation retry bounds.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Retry slots for transient failures.
    pub max_retries: u32,
    /// Hard ceiling on attempts of any class.
    pub total_attempts: u32,
    /// Outer bound on a single attempt, on top of the runner's own timers.
    pub per_call_timeout: Option<Duration>,
    /// Wall-clock budget for the whole loop.
    pub time_budget: Option<Duration>,
    /// Cancels pending sleeps and attempts.
    pub cancel: Option<CancellationToken>,
}

impl RetryOptions {
    /// Options from configuration, without cancellation.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            total_attempts: config.total_attempts,
            per_call_timeout: None,
            time_budget: config.time_budget_seconds.map(Duration::from_secs),
            cancel: None,
        }
    }

    /// Set the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Result of a retry loop.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Success value or the error that ended the loop.
    pub result: Result<T>,
    /// Attempts made, of any class.
    pub attempts: u32,
    /// Retry slots consumed by transient failures.
    pub retries: u32,
}

/// Backoff settings shared by all retry loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    rate_limit_max_delay: Duration,
    min_budget_margin: Duration,
}

impl RetryPolicy {
    /// Policy from configuration with random jitter.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            backoff: Backoff::new(
                Duration::from_millis(config.base_delay_ms),
                Duration::from_millis(config.max_delay_ms),
                Duration::from_millis(config.jitter_ms),
            ),
            rate_limit_max_delay: Duration::from_millis(config.rate_limit_max_delay_ms),
            min_budget_margin: Duration::from_millis(config.min_budget_margin_ms),
        }
    }

    /// Replace the jitter source.
    #[must_use]
    pub fn with_jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.backoff = self.backoff.with_jitter_source(jitter);
        self
    }

    /// The backoff schedule.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run `op` until it succeeds, fails fatally, or a bound is reached.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn with_retry<T, F, Fut>(
        &self,
        opts: &RetryOptions,
        mut op: F,
        observer: Option<&RetryObserver>,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut rate_limited = 0u32;

        let outcome = |result: Result<T>, attempts: u32, retries: u32| RetryOutcome {
            result,
            attempts,
            retries,
        };

        loop {
            if opts.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                let err = AppError::Cancelled(format!("cancelled before attempt {}", attempts + 1));
                return outcome(Err(err), attempts, retries);
            }
            if let Some(err) = self.check_budget(opts, started, Duration::ZERO, attempts, None) {
                return outcome(Err(err), attempts, retries);
            }

            attempts += 1;
            let mut attempt = CallAttempt {
                number: attempts,
                started_at: Instant::now(),
                class: None,
            };

            let result = match opts.per_call_timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempts)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Process(ProcessError::new(
                        ProcessErrorKind::Timeout,
                        format!(
                            "attempt {attempts} timed out after {}ms (limit {}ms)",
                            attempt.started_at.elapsed().as_millis(),
                            limit.as_millis()
                        ),
                        attempt.started_at.elapsed(),
                    ))),
                },
                None => op(attempts).await,
            };

            let err = match result {
                Ok(value) => {
                    if attempts > 1 {
                        info!(attempts, retries, "call succeeded after retry");
                    }
                    return outcome(Ok(value), attempts, retries);
                }
                Err(err) => err,
            };

            if err.is_cancelled() {
                return outcome(Err(err), attempts, retries);
            }

            let class = classify(&err);
            attempt.class = Some(class);

            let delay = match class {
                ErrorClass::Fatal => {
                    debug!(attempt = attempts, %err, "fatal error, not retrying");
                    return outcome(Err(err), attempts, retries);
                }
                ErrorClass::Transient if retries >= opts.max_retries => {
                    warn!(attempt = attempts, retries, %err, "retries exhausted");
                    return outcome(Err(err), attempts, retries);
                }
                ErrorClass::Transient => self.backoff.delay(retries),
                ErrorClass::RateLimited { retry_after } => retry_after.map_or_else(
                    || self.backoff.delay(rate_limited),
                    |d| d.min(self.rate_limit_max_delay),
                ),
            };

            if attempts >= opts.total_attempts {
                warn!(
                    attempt = attempts,
                    total_attempts = opts.total_attempts,
                    %err,
                    "attempt ceiling reached"
                );
                return outcome(Err(err), attempts, retries);
            }
            if let Some(budget_err) = self.check_budget(opts, started, delay, attempts, Some(&err))
            {
                return outcome(Err(budget_err), attempts, retries);
            }

            match class {
                ErrorClass::Transient => retries += 1,
                ErrorClass::RateLimited { .. } => rate_limited += 1,
                ErrorClass::Fatal => {}
            }

            warn!(
                attempt = attempts,
                class = class.as_str(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %err,
                "retrying after backoff"
            );
            notify(
                observer,
                &RetryNotice {
                    attempt,
                    error: &err,
                    delay,
                    class,
                },
            );

            if let Some(cancel) = &opts.cancel {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let err = AppError::Cancelled(format!(
                            "cancelled during backoff after attempt {attempts}"
                        ));
                        return outcome(Err(err), attempts, retries);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// `BudgetExhausted` if less than the safety margin would remain after
    /// waiting `upcoming`.
    fn check_budget(
        &self,
        opts: &RetryOptions,
        started: Instant,
        upcoming: Duration,
        attempts: u32,
        cause: Option<&AppError>,
    ) -> Option<AppError> {
        let budget = opts.time_budget?;
        let remaining = budget
            .saturating_sub(started.elapsed())
            .saturating_sub(upcoming);
        if remaining >= self.min_budget_margin {
            return None;
        }
        warn!(
            attempts,
            remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
            "time budget exhausted"
        );
        let mut message = format!(
            "{}ms of budget left after {attempts} attempts, below the {}ms margin",
            remaining.as_millis(),
            self.min_budget_margin.as_millis()
        );
        if let Some(cause) = cause {
            message.push_str(&format!("; last error: {cause}"));
        }
        Some(AppError::BudgetExhausted(message))
    }
}

fn notify(observer: Option<&RetryObserver>, notice: &RetryNotice<'_>) {
    let Some(observer) = observer else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(|| observer(notice))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "retry observer failed"),
        Err(_) => warn!("retry observer panicked"),
    }
}
