//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// What the process runner does once captured output reaches its ceiling.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard excess bytes and append a truncation marker.
    #[default]
    Truncate,
    /// Kill the process and fail with `output_too_large`.
    Fail,
}

/// External process invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessConfig {
    /// Binary to spawn for every call.
    pub command: String,
    /// Arguments passed on every call. The prompt is never one of them.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra arguments appended when resuming; `{token}` is substituted.
    #[serde(default = "default_resume_args")]
    pub resume_args: Vec<String>,
    /// Working directory for the child; inherits the parent's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Additional environment variable names projected into the child.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Absolute wall-clock ceiling per call.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Silence ceiling per call; 0 disables the idle timer.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Maximum stdout bytes retained per call.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Interval between heartbeat callbacks while a call is in flight.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    /// Behaviour once `max_output_bytes` is reached.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_resume_args() -> Vec<String> {
    vec!["--resume".into(), "{token}".into()]
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_idle_timeout_seconds() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_heartbeat_seconds() -> u64 {
    15
}

impl ProcessConfig {
    /// Absolute per-call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Idle timeout, or `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Retries available for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Hard ceiling on attempts of any kind, rate-limited ones included.
    #[serde(default = "default_total_attempts")]
    pub total_attempts: u32,
    /// Base delay doubled on every transient retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap applied before jitter.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to every delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Clamp applied to server-supplied rate-limit delays.
    #[serde(default = "default_rate_limit_max_delay_ms")]
    pub rate_limit_max_delay_ms: u64,
    /// Attempts are refused when less than this much budget remains.
    #[serde(default = "default_min_budget_margin_ms")]
    pub min_budget_margin_ms: u64,
    /// Optional overall time budget for one logical call.
    #[serde(default)]
    pub time_budget_seconds: Option<u64>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_total_attempts() -> u32 {
    8
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_ms() -> u64 {
    500
}

fn default_rate_limit_max_delay_ms() -> u64 {
    300_000
}

fn default_min_budget_margin_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            total_attempts: default_total_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            rate_limit_max_delay_ms: default_rate_limit_max_delay_ms(),
            min_budget_margin_ms: default_min_budget_margin_ms(),
            time_budget_seconds: None,
        }
    }
}

/// Per-class concurrency ceilings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GateConfig {
    /// Work class name to maximum simultaneous holders.
    #[serde(default = "default_gate_classes")]
    pub classes: HashMap<String, usize>,
}

fn default_gate_classes() -> HashMap<String, usize> {
    HashMap::from([("process".to_owned(), 2), ("network".to_owned(), 8)])
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            classes: default_gate_classes(),
        }
    }
}

/// Ledger retry ceiling and stale-recovery buffer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LedgerConfig {
    /// Maximum explicit `retry` resets per work item.
    #[serde(default = "default_ledger_max_retries")]
    pub max_retries: u32,
    /// Added to the process timeout to form the stale threshold.
    #[serde(default = "default_stale_buffer_seconds")]
    pub stale_buffer_seconds: u64,
}

fn default_ledger_max_retries() -> u32 {
    3
}

fn default_stale_buffer_seconds() -> u64 {
    60
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_ledger_max_retries(),
            stale_buffer_seconds: default_stale_buffer_seconds(),
        }
    }
}

/// Session account budget.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Tokens a session may accumulate before it is rolled over.
    #[serde(default = "default_budget_ceiling")]
    pub budget_ceiling: u64,
}

fn default_budget_ceiling() -> u64 {
    150_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            budget_ceiling: default_budget_ceiling(),
        }
    }
}

/// Thresholds for the "implausibly short resumed result" heuristic.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ResumeConfig {
    /// Resumed results shorter than this are suspect.
    #[serde(default = "default_min_result_chars")]
    pub min_result_chars: usize,
    /// ... but only when the call ran at least this long.
    #[serde(default = "default_min_elapsed_seconds")]
    pub min_elapsed_seconds: u64,
    /// Completed items folded into a reconstructed context.
    #[serde(default = "default_history_items")]
    pub history_items: u32,
    /// Character budget for the reconstructed context.
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

fn default_min_result_chars() -> usize {
    40
}

fn default_min_elapsed_seconds() -> u64 {
    20
}

fn default_history_items() -> u32 {
    5
}

fn default_summary_max_chars() -> usize {
    4_000
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            min_result_chars: default_min_result_chars(),
            min_elapsed_seconds: default_min_elapsed_seconds(),
            history_items: default_history_items(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file holding the ledger and session accounts.
    pub db_path: PathBuf,
    /// Days after completion before terminal work items are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// External process settings.
    pub process: ProcessConfig,
    /// Retry and backoff settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Concurrency ceilings.
    #[serde(default)]
    pub gate: GateConfig,
    /// Ledger settings.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Session account settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Resume heuristic settings.
    #[serde(default)]
    pub resume: ResumeConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Threshold past which a `running` item is considered abandoned.
    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        self.process.timeout() + Duration::from_secs(self.ledger.stale_buffer_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.process.command.trim().is_empty() {
            return Err(AppError::Config("process.command must not be empty".into()));
        }

        if self.process.timeout_seconds == 0 {
            return Err(AppError::Config(
                "process.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.process.max_output_bytes == 0 {
            return Err(AppError::Config(
                "process.max_output_bytes must be greater than zero".into(),
            ));
        }

        if self.retry.total_attempts == 0 {
            return Err(AppError::Config(
                "retry.total_attempts must be greater than zero".into(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(AppError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }

        if let Some((class, _)) = self.gate.classes.iter().find(|(_, limit)| **limit == 0) {
            return Err(AppError::Config(format!(
                "gate class {class} must allow at least one holder"
            )));
        }

        Ok(())
    }
}
