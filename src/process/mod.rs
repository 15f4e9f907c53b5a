//! External process invocation.
//!
//! One call spawns one child process. The prompt goes in on stdin; stdout
//! is both the captured output and a newline-delimited event stream;
//! stderr is kept only as a diagnostic tail.
//!
//! - `codec`: line framing with carry-over of partial lines.
//! - `events`: tagged decode of stream lines into [`StreamEvent`].
//! - `spawner`: environment projection, command construction, tree kill.
//! - `runner`: the supervised call with idle/absolute timers and output cap.

pub mod codec;
pub mod events;
pub mod runner;
pub mod spawner;

use std::fmt::{Display, Formatter};
use std::time::Duration;

pub use events::StreamEvent;
pub use runner::{ProcessRunner, RunOptions, RunOutput};
pub use spawner::CommandSpec;

/// Failure category of one process invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    /// Binary missing or not executable.
    SpawnFailed,
    /// Process exited with a non-zero status.
    NonZeroExit,
    /// Absolute wall-clock ceiling reached.
    Timeout,
    /// No output within the idle window.
    IdleTimeout,
    /// Output ceiling reached under the `fail` overflow policy.
    OutputTooLarge,
    /// Cancellation token fired while the call was in flight.
    Cancelled,
    /// Reading the child's pipes failed.
    Io,
}

impl ProcessErrorKind {
    /// Stable snake-case name used in messages and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpawnFailed => "spawn_failed",
            Self::NonZeroExit => "non_zero_exit",
            Self::Timeout => "timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::OutputTooLarge => "output_too_large",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        }
    }
}

impl Display for ProcessErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized failure of one process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessError {
    /// Failure category.
    pub kind: ProcessErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Time from spawn to failure.
    pub elapsed: Duration,
    /// Exit code, when the process exited on its own.
    pub exit_code: Option<i32>,
    /// Structured status signal reported on stdout (e.g. 429, 503).
    pub status: Option<u16>,
    /// Server-suggested delay before retrying.
    pub retry_after: Option<Duration>,
    /// Last bytes of stderr; diagnostic only.
    pub stderr_tail: String,
}

impl ProcessError {
    /// Construct an error with no exit or status details.
    #[must_use]
    pub fn new(kind: ProcessErrorKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            kind,
            message: message.into(),
            elapsed,
            exit_code: None,
            status: None,
            retry_after: None,
            stderr_tail: String::new(),
        }
    }
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProcessError {}
