//! Session account model: continuation token plus cumulative usage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::usage::Usage;

/// Lifecycle status for a session account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Token (if any) is usable for resume.
    Active,
    /// Budget ceiling crossed; token cleared until the next fresh call.
    Rolled,
    /// Explicitly closed; terminal.
    Closed,
}

impl AccountStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rolled => "rolled",
            Self::Closed => "closed",
        }
    }
}

/// Continuation and usage bookkeeping for one logical session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionAccount {
    /// Caller-chosen account identifier.
    pub id: String,
    /// Token used to resume the external session.
    pub continuation_token: Option<String>,
    /// Usage accumulated over the account's lifetime; never decreases.
    pub cumulative_usage: Usage,
    /// Cumulative total at the most recent rollover.
    pub rollover_baseline: u64,
    /// Number of rollovers performed.
    pub rollover_count: u32,
    /// Tokens allowed per session before rollover.
    pub budget_ceiling: u64,
    /// Current lifecycle status.
    pub status: AccountStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SessionAccount {
    /// Construct a fresh active account without a token.
    #[must_use]
    pub fn new(id: String, budget_ceiling: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            continuation_token: None,
            cumulative_usage: Usage::default(),
            rollover_baseline: 0,
            rollover_count: 0,
            budget_ceiling,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Usage accumulated since the last rollover.
    #[must_use]
    pub fn session_usage(&self) -> u64 {
        self.cumulative_usage
            .total()
            .saturating_sub(self.rollover_baseline)
    }

    /// Whether the current session has exceeded its ceiling.
    #[must_use]
    pub fn over_budget(&self) -> bool {
        self.session_usage() > self.budget_ceiling
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        matches!(
            (self.status, next),
            (AccountStatus::Active, AccountStatus::Rolled | AccountStatus::Closed)
                | (AccountStatus::Rolled, AccountStatus::Active | AccountStatus::Closed)
        )
    }
}
