//! Token usage reported by the external process.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Token counts for one call or an accumulated session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Usage {
    /// Prompt-side tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion-side tokens.
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    /// Construct a usage record.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Combined token count used for budget accounting.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
    }
}
