//! Session account repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::{AccountStatus, SessionAccount, Usage};
use crate::{AppError, Result};

use super::db::Database;
use super::{format_ts, parse_ts, to_i64, to_u64};

/// Repository wrapper around `SQLite` for session account records.
#[derive(Clone)]
pub struct SessionAccountRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionAccountRow {
    id: String,
    continuation_token: Option<String>,
    usage_input: i64,
    usage_output: i64,
    rollover_baseline: i64,
    rollover_count: i64,
    budget_ceiling: i64,
    status: String,
    created_at: String,
    updated_at: String,
}

impl SessionAccountRow {
    /// Convert a database row into the domain model.
    fn into_account(self) -> Result<SessionAccount> {
        let rollover_count = u32::try_from(self.rollover_count).map_err(|_| {
            AppError::Db(format!("invalid rollover_count: {}", self.rollover_count))
        })?;

        Ok(SessionAccount {
            status: parse_account_status(&self.status)?,
            cumulative_usage: Usage::new(
                to_u64("usage_input", self.usage_input)?,
                to_u64("usage_output", self.usage_output)?,
            ),
            rollover_baseline: to_u64("rollover_baseline", self.rollover_baseline)?,
            rollover_count,
            budget_ceiling: to_u64("budget_ceiling", self.budget_ceiling)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            id: self.id,
            continuation_token: self.continuation_token,
        })
    }
}

fn parse_account_status(s: &str) -> Result<AccountStatus> {
    match s {
        "active" => Ok(AccountStatus::Active),
        "rolled" => Ok(AccountStatus::Rolled),
        "closed" => Ok(AccountStatus::Closed),
        other => Err(AppError::Db(format!("invalid account status: {other}"))),
    }
}

impl SessionAccountRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert the account unless one with the same id already exists, then
    /// return the stored record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert or read-back fails.
    pub async fn create_if_missing(&self, account: &SessionAccount) -> Result<SessionAccount> {
        sqlx::query(
            "INSERT OR IGNORE INTO session_account (id, continuation_token, usage_input,
             usage_output, rollover_baseline, rollover_count, budget_ceiling, status,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&account.id)
        .bind(&account.continuation_token)
        .bind(to_i64("usage_input", account.cumulative_usage.input_tokens)?)
        .bind(to_i64("usage_output", account.cumulative_usage.output_tokens)?)
        .bind(to_i64("rollover_baseline", account.rollover_baseline)?)
        .bind(i64::from(account.rollover_count))
        .bind(to_i64("budget_ceiling", account.budget_ceiling)?)
        .bind(account.status.as_str())
        .bind(format_ts(account.created_at))
        .bind(format_ts(account.updated_at))
        .execute(self.db.as_ref())
        .await?;

        self.get_by_id(&account.id)
            .await?
            .ok_or_else(|| AppError::Db(format!("failed to create account {}", account.id)))
    }

    /// Retrieve an account by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<SessionAccount>> {
        let row: Option<SessionAccountRow> =
            sqlx::query_as("SELECT * FROM session_account WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(SessionAccountRow::into_account).transpose()
    }

    /// Add usage to a non-closed account. Returns `false` if no row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn add_usage(&self, id: &str, usage: Usage) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session_account SET usage_input = usage_input + ?1,
             usage_output = usage_output + ?2, updated_at = ?3
             WHERE id = ?4 AND status != 'closed'",
        )
        .bind(to_i64("usage_input", usage.input_tokens)?)
        .bind(to_i64("usage_output", usage.output_tokens)?)
        .bind(format_ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Clear the token and mark an `active` account `rolled`, moving the
    /// rollover baseline to the current cumulative total.
    ///
    /// Returns `false` if the account was not active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_rolled(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session_account SET status = 'rolled', continuation_token = NULL,
             rollover_baseline = usage_input + usage_output,
             rollover_count = rollover_count + 1, updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
        )
        .bind(format_ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Store a new token and status on a non-closed account.
    ///
    /// Returns `false` if no row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_token(
        &self,
        id: &str,
        token: Option<&str>,
        status: AccountStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session_account SET continuation_token = ?1, status = ?2, updated_at = ?3
             WHERE id = ?4 AND status != 'closed'",
        )
        .bind(token)
        .bind(status.as_str())
        .bind(format_ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark an account closed and drop its token.
    ///
    /// Returns `false` if the account was already closed or missing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn close(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session_account SET status = 'closed', continuation_token = NULL,
             updated_at = ?1
             WHERE id = ?2 AND status != 'closed'",
        )
        .bind(format_ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
