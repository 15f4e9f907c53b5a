//! End-to-end call coordination.
//!
//! One [`CallCoordinator::call`] runs the full flow:
//!
//! 1. wait for the scope's lock, then a gate slot in the request's class;
//! 2. sweep the scope for stale `running` items;
//! 3. `begin` the work item (a duplicate key or a scope already running
//!    elsewhere fails with `Conflict`);
//! 4. roll the session account over if it is past its budget;
//! 5. run the call through the resume resolver inside the retry loop,
//!    touching the item so other callers' sweeps leave it alone;
//! 6. write exactly one terminal state to the ledger;
//! 7. record usage and the new continuation token;
//! 8. release the gate slot and the scope lock (guard drops).
//!
//! Every failure after step 3 is written to the ledger before it is
//! returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::accounts::SessionAccounts;
use super::cancel::CancelSignal;
use super::gate::{ConcurrencyGate, ScopeLocks};
use super::resume::{CallRunner, ContinuationResolver, ResumeOutcome, ResumeStats};
use super::retry::{RetryObserver, RetryOptions, RetryOutcome, RetryPolicy};
use crate::config::GlobalConfig;
use crate::models::{Usage, WorkResult};
use crate::persistence::db::Database;
use crate::persistence::ledger::Ledger;
use crate::process::runner::{HeartbeatCallback, ProgressCallback};
use crate::process::RunOptions;
use crate::{AppError, Result};

/// Default work class for external process calls.
pub const DEFAULT_CLASS: &str = "process";

const STDERR_IN_ERROR_CHARS: usize = 500;

/// Running items are touched this many times per stale threshold.
const TOUCHES_PER_THRESHOLD: u32 = 4;

/// One logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    /// Ordering scope; calls within one scope are sequential.
    pub scope: String,
    /// Idempotency key within the scope.
    pub logical_key: String,
    /// Gate class the call is admitted under.
    pub class: String,
    /// Prompt delivered on stdin.
    pub prompt: String,
    /// Session account holding the continuation token, if any.
    pub account_id: Option<String>,
}

impl CallRequest {
    /// A request in the default class with no session account.
    #[must_use]
    pub fn new(
        scope: impl Into<String>,
        logical_key: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            logical_key: logical_key.into(),
            class: DEFAULT_CLASS.to_owned(),
            prompt: prompt.into(),
            account_id: None,
        }
    }

    /// Admit the call under `class`.
    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Resume and account usage against `account_id`.
    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Optional observers for one call.
#[derive(Clone, Default)]
pub struct CallHooks {
    /// Every decoded stdout event.
    pub on_progress: Option<ProgressCallback>,
    /// Periodic elapsed-time heartbeat.
    pub on_heartbeat: Option<HeartbeatCallback>,
    /// Every retry, before its backoff sleep.
    pub on_retry: Option<Arc<RetryObserver>>,
}

/// What a successful call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    /// Ledger work item id.
    pub item_id: String,
    /// Result text.
    pub text: String,
    /// Tokens consumed by the accepted call.
    pub usage: Usage,
    /// Continuation token reported by the process.
    pub continuation_token: Option<String>,
    /// Duration of the accepted call.
    pub duration_ms: u64,
    /// Whether the call continued the account's session.
    pub resumed: bool,
    /// Whether a fresh fallback call produced the result.
    pub fallback: bool,
    /// Whether the account rolled over before this call.
    pub rolled_over: bool,
    /// Whether the text was cut at the output ceiling.
    pub truncated: bool,
    /// Attempts made by the retry loop.
    pub attempts: u32,
    /// Retry slots consumed.
    pub retries: u32,
    /// Whether the completion was recorded; `false` if a stale sweep
    /// failed the item while the call was running.
    pub recorded: bool,
}

/// Runs calls through gate, ledger, accounts, resume and retry.
#[derive(Clone)]
pub struct CallCoordinator {
    ledger: Ledger,
    accounts: SessionAccounts,
    resolver: ContinuationResolver,
    retry: RetryPolicy,
    retry_options: RetryOptions,
    gate: ConcurrencyGate,
    scopes: ScopeLocks,
    run_defaults: RunOptions,
    stale_threshold: Duration,
}

impl CallCoordinator {
    /// Coordinator over `db` using `runner` for external calls.
    #[must_use]
    pub fn new(config: &GlobalConfig, db: Arc<Database>, runner: Arc<dyn CallRunner>) -> Self {
        let ledger = Ledger::new(Arc::clone(&db), config.ledger.max_retries);
        let resolver = ContinuationResolver::new(runner, Arc::new(ledger.clone()), &config.resume);
        Self {
            accounts: SessionAccounts::new(db, config.session.budget_ceiling),
            resolver,
            retry: RetryPolicy::from_config(&config.retry),
            retry_options: RetryOptions::from_config(&config.retry),
            gate: ConcurrencyGate::from_config(&config.gate),
            scopes: ScopeLocks::new(),
            run_defaults: RunOptions::from_config(&config.process),
            stale_threshold: config.stale_threshold(),
            ledger,
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The work item ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Session accounts.
    #[must_use]
    pub fn accounts(&self) -> &SessionAccounts {
        &self.accounts
    }

    /// The concurrency gate.
    #[must_use]
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Age past which a `running` item is presumed abandoned.
    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Resume counters for `scope`.
    #[must_use]
    pub fn resume_stats(&self, scope: &str) -> ResumeStats {
        self.resolver.stats(scope)
    }

    /// Run one logical call end to end.
    ///
    /// # Errors
    ///
    /// - `AppError::Gate` for an unknown work class;
    /// - `AppError::Conflict` if the key is already queued or running, or
    ///   another caller sharing the database is running an item of the
    ///   same scope;
    /// - `AppError::Cancelled` if `cancel` fires;
    /// - the final call error once retries are exhausted, after it has
    ///   been written to the ledger.
    pub async fn call(
        &self,
        request: &CallRequest,
        hooks: &CallHooks,
        cancel: &CancelSignal,
    ) -> Result<CallOutcome> {
        let span = info_span!(
            "call",
            scope = %request.scope,
            logical_key = %request.logical_key,
            class = %request.class
        );

        async {
            let _scope = self.scopes.lock(&request.scope, &cancel.token()).await?;
            let _permit = self
                .gate
                .acquire_cancellable(&request.class, &cancel.token())
                .await?;

            let recovered = self
                .ledger
                .recover_stale(&request.scope, self.stale_threshold)
                .await?;
            if recovered > 0 {
                info!(recovered, "recovered stale work items before begin");
            }

            let item_id = match self
                .ledger
                .begin_sequential(&request.scope, &request.logical_key, &request.prompt)
                .await
            {
                Ok(id) => id,
                Err(AppError::Conflict(reason)) => {
                    return Err(self.describe_conflict(request, reason).await);
                }
                Err(err) => return Err(err),
            };

            self.execute(
                &item_id,
                &request.scope,
                &request.prompt,
                request.account_id.as_deref(),
                hooks,
                cancel,
            )
            .await
        }
        .instrument(span)
        .await
    }

    /// Queue a call for [`run_next`](Self::run_next).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the key is already queued or running.
    pub async fn enqueue(&self, request: &CallRequest, priority: i64) -> Result<String> {
        self.ledger
            .enqueue(&request.scope, &request.logical_key, &request.prompt, priority)
            .await
    }

    /// Claim and run the next queued item, if any.
    ///
    /// Queued items use their scope as the session account id. Returns
    /// `Ok(None)` when nothing is claimable.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call), minus `Conflict`.
    pub async fn run_next(
        &self,
        scope: Option<&str>,
        class: &str,
        hooks: &CallHooks,
        cancel: &CancelSignal,
    ) -> Result<Option<CallOutcome>> {
        let _permit = self.gate.acquire_cancellable(class, &cancel.token()).await?;

        if let Some(scope) = scope {
            self.ledger.recover_stale(scope, self.stale_threshold).await?;
        }

        let Some(item) = self.ledger.claim_next(scope).await? else {
            return Ok(None);
        };

        let span = info_span!("run_next", scope = %item.scope, logical_key = %item.logical_key);
        self.execute(&item.id, &item.scope, &item.payload, Some(&item.scope), hooks, cancel)
            .instrument(span)
            .await
            .map(Some)
    }

    /// Name the item already holding the key, when there is one.
    async fn describe_conflict(&self, request: &CallRequest, reason: String) -> AppError {
        match self
            .ledger
            .find_active(&request.scope, &request.logical_key)
            .await
        {
            Ok(Some(active)) => {
                info!(active_item_id = active.id, "work item already in progress");
                AppError::Conflict(format!(
                    "work item {}/{} is already {} as {}",
                    request.scope,
                    request.logical_key,
                    active.status.as_str(),
                    active.id
                ))
            }
            Ok(None) => {
                info!(%reason, "scope busy");
                AppError::Conflict(reason)
            }
            Err(err) => {
                warn!(%err, "failed to look up the conflicting work item");
                AppError::Conflict(reason)
            }
        }
    }

    // ── Execution of a running item ─────────────────────────

    async fn execute(
        &self,
        item_id: &str,
        scope: &str,
        prompt: &str,
        account_id: Option<&str>,
        hooks: &CallHooks,
        cancel: &CancelSignal,
    ) -> Result<CallOutcome> {
        let rolled_over = match self.prepare_account(account_id).await {
            Ok(rolled) => rolled,
            Err(err) => {
                self.record_failure(item_id, &err, 0).await;
                return Err(err);
            }
        };

        let mut run_opts = self.run_defaults.clone();
        run_opts.on_progress.clone_from(&hooks.on_progress);
        run_opts.on_heartbeat.clone_from(&hooks.on_heartbeat);
        run_opts.cancel = Some(cancel.token());
        let retry_opts = self.retry_options.clone().with_cancel(cancel.token());
        let run_opts = &run_opts;
        let needs_context = &AtomicBool::new(rolled_over);

        let work = self.retry.with_retry(
            &retry_opts,
            |attempt| async move {
                self.attempt(attempt, scope, prompt, account_id, needs_context, run_opts)
                    .await
            },
            hooks.on_retry.as_deref(),
        );
        let RetryOutcome {
            result,
            attempts,
            retries,
        } = self.keep_alive(item_id, work).await;

        let resume = match result {
            Ok(resume) => resume,
            Err(err) => {
                self.record_failure(item_id, &err, attempts).await;
                return Err(err);
            }
        };

        let output = resume.output;
        let work_result = WorkResult {
            text: output.text.clone(),
            usage: output.usage,
            continuation_token: output.continuation_token.clone(),
            duration_ms: output.duration_ms,
        };
        let recorded = self.ledger.complete(item_id, &work_result).await?;
        if !recorded {
            warn!(item_id, "work item was no longer running; completion not recorded");
        }

        if let Some(account) = account_id {
            self.accounts.record_usage(account, output.usage).await?;
            if !resume.token_mismatch {
                if let Some(token) = output.continuation_token.as_deref() {
                    self.accounts.update_token(account, Some(token)).await?;
                }
            }
        }

        info!(
            item_id,
            attempts,
            retries,
            resumed = resume.resumed,
            fallback = resume.fallback,
            duration_ms = output.duration_ms,
            "call completed"
        );

        Ok(CallOutcome {
            item_id: item_id.to_owned(),
            text: output.text,
            usage: output.usage,
            continuation_token: output.continuation_token,
            duration_ms: output.duration_ms,
            resumed: resume.resumed,
            fallback: resume.fallback,
            rolled_over,
            truncated: output.truncated,
            attempts,
            retries,
            recorded,
        })
    }

    /// Open the account and apply the budget check. Returns whether it
    /// rolled over.
    async fn prepare_account(&self, account_id: Option<&str>) -> Result<bool> {
        let Some(account) = account_id else {
            return Ok(false);
        };
        self.accounts.open(account).await?;
        let check = self.accounts.pre_call_check(account).await?;
        if let Some(message) = &check.message {
            info!(account_id = account, message, "session rolled over");
        }
        Ok(check.rolled)
    }

    /// Drive `work` to completion while touching the item often enough
    /// that no other caller's stale sweep reclaims it.
    async fn keep_alive<F>(&self, item_id: &str, work: F) -> F::Output
    where
        F: std::future::Future,
    {
        let period =
            (self.stale_threshold / TOUCHES_PER_THRESHOLD).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                output = &mut work => return output,
                _ = ticker.tick() => match self.ledger.touch(item_id).await {
                    Ok(true) => debug!(item_id, "work item touched"),
                    Ok(false) => warn!(item_id, "work item no longer running; call continues"),
                    Err(err) => warn!(item_id, %err, "failed to touch work item"),
                },
            }
        }
    }

    /// One attempt inside the retry loop. The token is re-read each time,
    /// so an attempt after an invalidation starts fresh. Once the session
    /// has rolled over or its token was invalidated, every later fresh
    /// attempt carries the rebuilt context.
    async fn attempt(
        &self,
        attempt: u32,
        scope: &str,
        prompt: &str,
        account_id: Option<&str>,
        needs_context: &AtomicBool,
        run_opts: &RunOptions,
    ) -> Result<ResumeOutcome> {
        let token = match account_id {
            Some(account) => self.accounts.token(account).await?,
            None => None,
        };

        if token.is_none() && needs_context.load(Ordering::SeqCst) {
            info!(attempt, "starting fresh session with rebuilt context");
            let output = self
                .resolver
                .call_fresh_with_context(scope, prompt, run_opts)
                .await?;
            return Ok(ResumeOutcome {
                output,
                resumed: false,
                fallback: false,
                token_mismatch: false,
                calls: 1,
            });
        }

        let report = self
            .resolver
            .call_with_resume(scope, prompt, token.as_deref(), run_opts)
            .await;
        if report.token_invalidated {
            needs_context.store(true, Ordering::SeqCst);
            if let Some(account) = account_id {
                self.accounts.update_token(account, None).await?;
                info!(account_id = account, "continuation token invalidated");
            }
        }
        report.result
    }

    /// Write the terminal failure; the ledger guard makes this a no-op if
    /// the item is already terminal.
    async fn record_failure(&self, item_id: &str, err: &AppError, attempts: u32) {
        let text = failure_text(err, attempts);
        match self.ledger.fail(item_id, &text).await {
            Ok(true) => warn!(item_id, attempts, error = %text, "call failed"),
            Ok(false) => warn!(item_id, "work item already terminal; failure not recorded"),
            Err(db_err) => error!(item_id, %db_err, error = %text, "failed to record call failure"),
        }
    }
}

fn failure_text(err: &AppError, attempts: u32) -> String {
    let mut text = if attempts > 0 {
        format!("{err} (after {attempts} attempt(s))")
    } else {
        err.to_string()
    };
    if let Some(process) = err.as_process() {
        let tail = process.stderr_tail.trim();
        if !tail.is_empty() {
            let skip = tail.chars().count().saturating_sub(STDERR_IN_ERROR_CHARS);
            let tail: String = tail.chars().skip(skip).collect();
            text.push_str("; stderr: ");
            text.push_str(&tail);
        }
    }
    text
}
