//! Session accounting: continuation token and usage per logical session.
//!
//! State machine: `active -> rolled` when usage since the last rollover
//! crosses the ceiling (token cleared, counters kept); `rolled -> active`
//! when the next successful call installs a new token; `active | rolled ->
//! closed`, terminal.

use std::sync::Arc;

use tracing::info;

use crate::models::{AccountStatus, SessionAccount, Usage};
use crate::persistence::db::Database;
use crate::persistence::session_account_repo::SessionAccountRepo;
use crate::{AppError, Result};

/// Outcome of [`SessionAccounts::pre_call_check`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RolloverCheck {
    /// Whether this check rolled the account over.
    pub rolled: bool,
    /// Human-readable explanation when `rolled` is set.
    pub message: Option<String>,
}

/// Owner of every session account mutation.
#[derive(Clone)]
pub struct SessionAccounts {
    repo: SessionAccountRepo,
    default_ceiling: u64,
}

impl SessionAccounts {
    /// Accounts stored in `db`, created with `default_ceiling` tokens.
    #[must_use]
    pub fn new(db: Arc<Database>, default_ceiling: u64) -> Self {
        Self {
            repo: SessionAccountRepo::new(db),
            default_ceiling,
        }
    }

    /// Fetch the account, creating an `active` one if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on storage failure.
    pub async fn open(&self, id: &str) -> Result<SessionAccount> {
        self.repo
            .create_if_missing(&SessionAccount::new(id.to_owned(), self.default_ceiling))
            .await
    }

    /// Fetch an account.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on storage failure.
    pub async fn get(&self, id: &str) -> Result<Option<SessionAccount>> {
        self.repo.get_by_id(id).await
    }

    /// Roll the account over if it has crossed its budget ceiling.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown account and
    /// `AppError::InvalidTransition` for a closed one.
    pub async fn pre_call_check(&self, id: &str) -> Result<RolloverCheck> {
        let account = self.require_open(id).await?;
        if !account.over_budget() {
            return Ok(RolloverCheck::default());
        }

        let usage = account.session_usage();
        if !self.repo.mark_rolled(id).await? {
            // Already rolled by a concurrent check.
            return Ok(RolloverCheck::default());
        }

        info!(
            account_id = id,
            session_usage = usage,
            budget_ceiling = account.budget_ceiling,
            "session budget exceeded, rolling over"
        );
        Ok(RolloverCheck {
            rolled: true,
            message: Some(format!(
                "session {id} used {usage} tokens (ceiling {}); starting a fresh session",
                account.budget_ceiling
            )),
        })
    }

    /// Add `usage` to the account's cumulative total.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition` if the
    /// account is missing or closed.
    pub async fn record_usage(&self, id: &str, usage: Usage) -> Result<()> {
        if self.repo.add_usage(id, usage).await? {
            return Ok(());
        }
        self.require_open(id).await.map(|_| ())
    }

    /// Install or clear the continuation token.
    ///
    /// Installing a token makes the account `active`; clearing keeps the
    /// current status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition` if the
    /// account is missing or closed.
    pub async fn update_token(&self, id: &str, token: Option<&str>) -> Result<()> {
        let account = self.require_open(id).await?;
        let status = if token.is_some() {
            AccountStatus::Active
        } else {
            account.status
        };

        if account.status != status {
            info!(
                account_id = id,
                from = account.status.as_str(),
                to = status.as_str(),
                "session account reactivated"
            );
        }

        if self.repo.set_token(id, token, status).await? {
            Ok(())
        } else {
            Err(AppError::InvalidTransition(format!(
                "session account {id} was closed concurrently"
            )))
        }
    }

    /// Stored continuation token, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition` if the
    /// account is missing or closed.
    pub async fn token(&self, id: &str) -> Result<Option<String>> {
        Ok(self.require_open(id).await?.continuation_token)
    }

    /// Close the account. Returns `false` if it was already closed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown account.
    pub async fn close(&self, id: &str) -> Result<bool> {
        if self.repo.close(id).await? {
            info!(account_id = id, "session account closed");
            return Ok(true);
        }
        match self.repo.get_by_id(id).await? {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("session account {id}"))),
        }
    }

    async fn require_open(&self, id: &str) -> Result<SessionAccount> {
        let account = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session account {id}")))?;
        if account.status == AccountStatus::Closed {
            return Err(AppError::InvalidTransition(format!(
                "session account {id} is closed"
            )));
        }
        Ok(account)
    }
}
