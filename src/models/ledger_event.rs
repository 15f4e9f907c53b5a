//! Append-only ledger event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transition recorded in the per-scope event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    /// Item created directly in `running` by `begin`.
    Begun,
    /// Item created in `queued`.
    Enqueued,
    /// Queued item claimed by a worker.
    Claimed,
    /// Item completed with a result.
    Completed,
    /// Item failed with an error.
    Failed,
    /// Running item reclaimed by a stale sweep.
    StaleRecovered,
    /// Terminal item reset to `queued`.
    Retried,
}

impl LedgerEventKind {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Begun => "begun",
            Self::Enqueued => "enqueued",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::StaleRecovered => "stale_recovered",
            Self::Retried => "retried",
        }
    }
}

/// One row of the append-only ledger event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LedgerEvent {
    /// Scope the event belongs to.
    pub scope: String,
    /// Monotonically increasing sequence number within the scope (1-based).
    pub seq: i64,
    /// Work item the transition applied to.
    pub work_item_id: String,
    /// Transition kind.
    pub kind: LedgerEventKind,
    /// Optional free-form detail (error text, retry count).
    pub detail: Option<String>,
    /// When the event was appended.
    pub created_at: DateTime<Utc>,
}
