//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::process::ProcessError;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// External process invocation failed.
    Process(ProcessError),
    /// A non-terminal work item already exists for the logical key.
    ///
    /// Callers treat this as "already in progress", not as a user-facing
    /// failure.
    Conflict(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Requested state change is not permitted from the current state.
    InvalidTransition(String),
    /// The operation was cancelled through a cancellation token.
    Cancelled(String),
    /// Remaining time budget is too small to start another attempt.
    BudgetExhausted(String),
    /// Concurrency gate misuse (unknown work class or closed gate).
    Gate(String),
}

impl AppError {
    /// Borrow the inner process error, if this is one.
    #[must_use]
    pub fn as_process(&self) -> Option<&ProcessError> {
        match self {
            Self::Process(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this error reports a cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::Process(err) => err.kind == crate::process::ProcessErrorKind::Cancelled,
            _ => false,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Process(err) => write!(f, "process: {err}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::BudgetExhausted(msg) => write!(f, "budget exhausted: {msg}"),
            Self::Gate(msg) => write!(f, "gate: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<ProcessError> for AppError {
    fn from(err: ProcessError) -> Self {
        Self::Process(err)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
