//! Resume-versus-fresh decisions for continuation tokens.
//!
//! A call with a token is tagged to resume that session. Three outcomes
//! count as a resume fallback:
//!
//! - the process exits non-zero for a reason retrying cannot fix: the
//!   token is invalidated and one fresh call is made with a context
//!   summary prepended;
//! - the result reports a different session id: the token is invalidated
//!   and the result is returned as not resumed;
//! - the result is implausibly short for the time spent: one fresh call
//!   with a context summary replaces it.
//!
//! Fallback calls are never themselves resumed or retried here.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use super::retry::{classify_process, ErrorClass};
use crate::config::ResumeConfig;
use crate::models::WorkItem;
use crate::persistence::ledger::Ledger;
use crate::process::{ProcessError, ProcessErrorKind, ProcessRunner, RunOptions, RunOutput};
use crate::{AppError, Result};

/// Boxed future returned by the object-safe traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Executes one external call.
///
/// Implemented by [`ProcessRunner`]; tests substitute scripted runners.
pub trait CallRunner: Send + Sync {
    /// Run `prompt`, resuming `resume_token` when given.
    fn run_call<'a>(
        &'a self,
        prompt: &'a str,
        resume_token: Option<&'a str>,
        opts: &'a RunOptions,
    ) -> BoxFuture<'a, std::result::Result<RunOutput, ProcessError>>;
}

impl CallRunner for ProcessRunner {
    fn run_call<'a>(
        &'a self,
        prompt: &'a str,
        resume_token: Option<&'a str>,
        opts: &'a RunOptions,
    ) -> BoxFuture<'a, std::result::Result<RunOutput, ProcessError>> {
        Box::pin(self.run(prompt, resume_token, opts))
    }
}

/// Durable history used to rebuild context for a fresh session.
pub trait ContextSource: Send + Sync {
    /// The most recent `limit` completed items of `scope`, oldest first.
    fn recent_history<'a>(&'a self, scope: &'a str, limit: u32)
        -> BoxFuture<'a, Result<Vec<WorkItem>>>;
}

impl ContextSource for Ledger {
    fn recent_history<'a>(
        &'a self,
        scope: &'a str,
        limit: u32,
    ) -> BoxFuture<'a, Result<Vec<WorkItem>>> {
        Box::pin(self.history(scope, limit))
    }
}

/// Render completed items as a context preamble of at most `max_chars`.
///
/// Returns `None` when there is no history.
#[must_use]
pub fn build_context_summary(items: &[WorkItem], max_chars: usize) -> Option<String> {
    if items.is_empty() || max_chars == 0 {
        return None;
    }

    let header = "Context from earlier calls in this scope:\n";
    let per_item = (max_chars.saturating_sub(header.len()) / items.len()).max(64);
    let per_field = per_item / 2;

    let mut summary = String::from(header);
    for (index, item) in items.iter().enumerate() {
        let result = item.result.as_ref().map_or("", |r| r.text.as_str());
        summary.push_str(&format!(
            "\n[{}] {}\nPrompt: {}\nResult: {}\n",
            index + 1,
            item.logical_key,
            clip(&item.payload, per_field),
            clip(result, per_field),
        ));
    }

    Some(clip(&summary, max_chars))
}

/// Prepend a context summary to a prompt.
#[must_use]
pub fn with_context(summary: &str, prompt: &str) -> String {
    format!("{summary}\n---\n\n{prompt}")
}

fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut clipped: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    clipped.push_str("...");
    clipped
}

/// Thresholds for "implausibly short" resumed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeHeuristic {
    /// Results shorter than this many characters are suspect...
    pub min_result_chars: usize,
    /// ...when at least this much time was spent producing them.
    pub min_elapsed: Duration,
}

impl ResumeHeuristic {
    /// Thresholds from configuration.
    #[must_use]
    pub fn from_config(config: &ResumeConfig) -> Self {
        Self {
            min_result_chars: config.min_result_chars,
            min_elapsed: Duration::from_secs(config.min_elapsed_seconds),
        }
    }

    /// Whether `text` is too short for a call that took `elapsed`.
    #[must_use]
    pub fn is_implausibly_short(&self, text: &str, elapsed: Duration) -> bool {
        elapsed >= self.min_elapsed && text.trim().chars().count() < self.min_result_chars
    }
}

/// Read-only resume counters for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeStats {
    /// Calls made with a continuation token.
    pub resume_attempted: u64,
    /// Resumed calls accepted as-is.
    pub resume_succeeded: u64,
    /// Resumed calls that fell back to a fresh session.
    pub resume_fallback: u64,
}

/// A completed call and how it was served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeOutcome {
    /// The accepted call output.
    pub output: RunOutput,
    /// Whether the output continues the supplied session.
    pub resumed: bool,
    /// Whether a fresh fallback call produced the output.
    pub fallback: bool,
    /// Whether the process answered from a different session than the one
    /// supplied; its token must not be installed.
    pub token_mismatch: bool,
    /// External calls made, including the fallback.
    pub calls: u32,
}

/// Result of [`ContinuationResolver::call_with_resume`].
///
/// `token_invalidated` is reported on failure too, so the caller can drop
/// a dead token even when the fallback call also fails.
#[derive(Debug)]
pub struct ResumeReport {
    /// The call outcome.
    pub result: Result<ResumeOutcome>,
    /// Whether the supplied token must no longer be used.
    pub token_invalidated: bool,
}

/// Decides between resuming and starting fresh.
#[derive(Clone)]
pub struct ContinuationResolver {
    runner: Arc<dyn CallRunner>,
    context: Arc<dyn ContextSource>,
    heuristic: ResumeHeuristic,
    history_items: u32,
    summary_max_chars: usize,
    stats: Arc<Mutex<HashMap<String, ResumeStats>>>,
}

impl ContinuationResolver {
    /// Resolver over `runner`, rebuilding context from `context`.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CallRunner>,
        context: Arc<dyn ContextSource>,
        config: &ResumeConfig,
    ) -> Self {
        Self {
            runner,
            context,
            heuristic: ResumeHeuristic::from_config(config),
            history_items: config.history_items,
            summary_max_chars: config.summary_max_chars,
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Counters for `scope`.
    #[must_use]
    pub fn stats(&self, scope: &str) -> ResumeStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .copied()
            .unwrap_or_default()
    }

    /// Run `prompt`, resuming `token` when given.
    pub async fn call_with_resume(
        &self,
        scope: &str,
        prompt: &str,
        token: Option<&str>,
        opts: &RunOptions,
    ) -> ResumeReport {
        let Some(token) = token else {
            let result = self
                .runner
                .run_call(prompt, None, opts)
                .await
                .map(|output| ResumeOutcome {
                    output,
                    resumed: false,
                    fallback: false,
                    token_mismatch: false,
                    calls: 1,
                })
                .map_err(AppError::from);
            return ResumeReport {
                result,
                token_invalidated: false,
            };
        };

        self.bump(scope, |s| s.resume_attempted += 1);

        let output = match self.runner.run_call(prompt, Some(token), opts).await {
            Ok(output) => output,
            Err(err) if is_resume_failure(&err) => {
                warn!(scope, %err, "resumed call failed, falling back to a fresh session");
                self.bump(scope, |s| s.resume_fallback += 1);
                return ResumeReport {
                    result: self.fallback(scope, prompt, opts).await,
                    token_invalidated: true,
                };
            }
            Err(err) => {
                return ResumeReport {
                    result: Err(err.into()),
                    token_invalidated: false,
                };
            }
        };

        if let Some(reported) = output.continuation_token.as_deref() {
            if reported != token {
                warn!(
                    scope,
                    supplied = token,
                    reported,
                    "process started a new session instead of resuming"
                );
                self.bump(scope, |s| s.resume_fallback += 1);
                return ResumeReport {
                    result: Ok(ResumeOutcome {
                        output,
                        resumed: false,
                        fallback: false,
                        token_mismatch: true,
                        calls: 1,
                    }),
                    token_invalidated: true,
                };
            }
        }

        let elapsed = Duration::from_millis(output.duration_ms);
        if self.heuristic.is_implausibly_short(&output.text, elapsed) {
            warn!(
                scope,
                result_chars = output.text.trim().chars().count(),
                elapsed_ms = output.duration_ms,
                "resumed result implausibly short, re-issuing with rebuilt context"
            );
            self.bump(scope, |s| s.resume_fallback += 1);
            return ResumeReport {
                result: self.fallback(scope, prompt, opts).await,
                token_invalidated: true,
            };
        }

        self.bump(scope, |s| s.resume_succeeded += 1);
        ResumeReport {
            result: Ok(ResumeOutcome {
                output,
                resumed: true,
                fallback: false,
                token_mismatch: false,
                calls: 1,
            }),
            token_invalidated: false,
        }
    }

    /// One fresh call with the scope's history prepended as context.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or `AppError::Db` if history cannot be read.
    pub async fn call_fresh_with_context(
        &self,
        scope: &str,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<RunOutput> {
        let history = self
            .context
            .recent_history(scope, self.history_items)
            .await?;
        let input = match build_context_summary(&history, self.summary_max_chars) {
            Some(summary) => {
                info!(scope, history_items = history.len(), "rebuilt context for fresh session");
                with_context(&summary, prompt)
            }
            None => prompt.to_owned(),
        };
        Ok(self.runner.run_call(&input, None, opts).await?)
    }

    async fn fallback(&self, scope: &str, prompt: &str, opts: &RunOptions) -> Result<ResumeOutcome> {
        let output = self.call_fresh_with_context(scope, prompt, opts).await?;
        Ok(ResumeOutcome {
            output,
            resumed: false,
            fallback: true,
            token_mismatch: false,
            calls: 2,
        })
    }

    fn bump(&self, scope: &str, update: impl FnOnce(&mut ResumeStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(stats.entry(scope.to_owned()).or_default());
    }
}

/// A non-zero exit that retrying the same session cannot fix.
///
/// Rate limits and transient failures keep the token and go back to the
/// retry loop.
fn is_resume_failure(err: &ProcessError) -> bool {
    err.kind == ProcessErrorKind::NonZeroExit && classify_process(err) == ErrorClass::Fatal
}
