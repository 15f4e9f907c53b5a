//! Ledger work item model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::usage::Usage;

/// Lifecycle status for a logical work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting in the queue for a worker.
    Queued,
    /// A caller owns the item and a process call is in flight.
    Running,
    /// Finished with a stored result.
    Completed,
    /// Finished with an error message.
    Failed,
}

impl WorkStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition happens without an explicit retry.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `Completed`/`Failed` → `Queued` is the explicit retry path.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed)
                | (Self::Completed | Self::Failed, Self::Queued)
        )
    }
}

/// Outcome recorded on a completed work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkResult {
    /// Text produced by the external process.
    pub text: String,
    /// Tokens consumed by the call.
    pub usage: Usage,
    /// Continuation token reported by the call, if any.
    pub continuation_token: Option<String>,
    /// Wall-clock duration of the successful call.
    pub duration_ms: u64,
}

/// One logical unit of work tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkItem {
    /// Unique record identifier.
    pub id: String,
    /// Logical scope (one debate, one build run).
    pub scope: String,
    /// Caller-chosen idempotency key within the scope.
    pub logical_key: String,
    /// Current lifecycle status.
    pub status: WorkStatus,
    /// Prompt delivered to the external process.
    pub payload: String,
    /// Queue priority; lower numbers run first.
    pub priority: i64,
    /// Stored result once completed.
    pub result: Option<WorkResult>,
    /// Number of explicit retries so far.
    pub retry_count: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the item last entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Last liveness signal from the caller running the item.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure reason.
    pub error_text: Option<String>,
}

impl WorkItem {
    /// Construct a new item in the given initial status.
    ///
    /// `Running` items get `started_at` set to the creation time.
    #[must_use]
    pub fn new(
        scope: String,
        logical_key: String,
        payload: String,
        priority: i64,
        status: WorkStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            scope,
            logical_key,
            status,
            payload,
            priority,
            result: None,
            retry_count: 0,
            created_at: now,
            started_at: (status == WorkStatus::Running).then_some(now),
            heartbeat_at: None,
            completed_at: None,
            error_text: None,
        }
    }
}
