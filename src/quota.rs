use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{EmailAddress, OwnerId};
use crate::error_chain_fmt;

/// A mailbox credential usable to transmit messages, with its own share of
/// the owner-wide daily quota.
#[derive(Debug, Clone)]
pub struct SenderAccount {
    pub id: Uuid,
    pub email: String,
    pub credential: SecretString,
    pub is_active: bool,
    pub sent_count: i32,
    pub last_reset: NaiveDate,
    pub default_cc: String,
    pub default_bcc: String,
    pub created_at: DateTime<Utc>,
}

/// Per-account view exposed to dashboards and preflight checks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountStats {
    pub id: Uuid,
    pub email: String,
    pub sent_today: i32,
    pub remaining: u32,
    pub limit: u32,
    pub percentage_used: f32,
    pub is_active: bool,
    pub default_cc: String,
    pub default_bcc: String,
    pub created_at: DateTime<Utc>,
}

#[derive(thiserror::Error)]
pub enum QuotaError {
    #[error("no active sender account {email} registered for this owner")]
    UnknownSender { email: String },
    #[error("sender account not found or access denied")]
    NotFound,
    #[error("sender account {email} already exists for this owner")]
    Duplicate { email: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl std::fmt::Debug for QuotaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Persisted per-owner, per-sender-account daily counters.
///
/// Every read and mutation is scoped by `(owner, email)`; scoping by email
/// alone would credit the wrong tenant when two tenants register the same
/// external mailbox address.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    fn daily_limit(&self) -> u32;

    /// Zero `sent_count` for every account whose `last_reset` predates
    /// today. Idempotent; returns the number of accounts reset.
    async fn reset_if_stale(&self, owner: OwnerId) -> Result<u64, QuotaError>;

    /// Active accounts, oldest-created first.
    async fn list_active(&self, owner: OwnerId) -> Result<Vec<SenderAccount>, QuotaError>;

    async fn quota_remaining(&self, owner: OwnerId, email: &str) -> Result<u32, QuotaError>;

    async fn record_send(&self, owner: OwnerId, email: &str) -> Result<(), QuotaError>;

    async fn stats(&self, owner: OwnerId) -> Result<Vec<AccountStats>, QuotaError>;
}

#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
    daily_limit: u32,
}

#[derive(sqlx::FromRow)]
struct SenderAccountRow {
    id: Uuid,
    email: String,
    credential: String,
    is_active: bool,
    sent_count: i32,
    last_reset: NaiveDate,
    default_cc: String,
    default_bcc: String,
    created_at: DateTime<Utc>,
}

impl From<SenderAccountRow> for SenderAccount {
    fn from(row: SenderAccountRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            credential: SecretString::from(row.credential),
            is_active: row.is_active,
            sent_count: row.sent_count,
            last_reset: row.last_reset,
            default_cc: row.default_cc,
            default_bcc: row.default_bcc,
            created_at: row.created_at,
        }
    }
}

const ACCOUNT_COLUMNS: &str = "id, email, credential, is_active, sent_count, last_reset, \
     default_cc, default_bcc, created_at";

impl PgQuotaStore {
    pub fn new(pool: PgPool, daily_limit: u32) -> Self {
        Self { pool, daily_limit }
    }

    #[tracing::instrument(name = "Register sender account", skip(self, credential))]
    pub async fn add_account(
        &self,
        owner: OwnerId,
        email: &EmailAddress,
        credential: SecretString,
        default_cc: &str,
        default_bcc: &str,
    ) -> Result<Uuid, QuotaError> {
        use secrecy::ExposeSecret;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO sender_accounts (id, owner_id, email, credential, default_cc, default_bcc)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(*owner.as_ref())
        .bind(email.as_ref())
        .bind(credential.expose_secret())
        .bind(default_cc)
        .bind(default_bcc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                QuotaError::Duplicate {
                    email: email.as_ref().to_owned(),
                }
            } else {
                QuotaError::Database(e)
            }
        })?;

        Ok(id)
    }

    #[tracing::instrument(name = "Update sender account", skip(self, credential))]
    pub async fn update_account(
        &self,
        owner: OwnerId,
        account_id: Uuid,
        email: &EmailAddress,
        credential: SecretString,
        is_active: bool,
        default_cc: &str,
        default_bcc: &str,
    ) -> Result<(), QuotaError> {
        use secrecy::ExposeSecret;

        let result = sqlx::query(
            "UPDATE sender_accounts
             SET email = $1, credential = $2, is_active = $3,
                 default_cc = $4, default_bcc = $5, updated_at = now()
             WHERE id = $6 AND owner_id = $7",
        )
        .bind(email.as_ref())
        .bind(credential.expose_secret())
        .bind(is_active)
        .bind(default_cc)
        .bind(default_bcc)
        .bind(account_id)
        .bind(*owner.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuotaError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(name = "Delete sender account", skip(self))]
    pub async fn delete_account(&self, owner: OwnerId, account_id: Uuid) -> Result<(), QuotaError> {
        let result = sqlx::query("DELETE FROM sender_accounts WHERE id = $1 AND owner_id = $2")
            .bind(account_id)
            .bind(*owner.as_ref())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QuotaError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    #[tracing::instrument(name = "Reset stale daily counters", skip(self))]
    async fn reset_if_stale(&self, owner: OwnerId) -> Result<u64, QuotaError> {
        let today = Utc::now().date_naive();
        let result = sqlx::query(
            "UPDATE sender_accounts
             SET sent_count = 0, last_reset = $1
             WHERE owner_id = $2 AND last_reset < $1",
        )
        .bind(today)
        .bind(*owner.as_ref())
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            tracing::info!(accounts = reset, "Reset daily send counters");
        }
        Ok(reset)
    }

    #[tracing::instrument(name = "List active sender accounts", skip(self))]
    async fn list_active(&self, owner: OwnerId) -> Result<Vec<SenderAccount>, QuotaError> {
        let rows = sqlx::query_as::<_, SenderAccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM sender_accounts
             WHERE owner_id = $1 AND is_active = TRUE
             ORDER BY created_at"
        ))
        .bind(*owner.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(name = "Read remaining quota", skip(self))]
    async fn quota_remaining(&self, owner: OwnerId, email: &str) -> Result<u32, QuotaError> {
        let sent_count: Option<(i32,)> = sqlx::query_as(
            "SELECT sent_count FROM sender_accounts
             WHERE owner_id = $1 AND email = $2 AND is_active = TRUE",
        )
        .bind(*owner.as_ref())
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        match sent_count {
            Some((sent,)) => Ok(self.daily_limit.saturating_sub(sent.max(0) as u32)),
            None => Err(QuotaError::UnknownSender {
                email: email.to_owned(),
            }),
        }
    }

    #[tracing::instrument(name = "Record confirmed send", skip(self))]
    async fn record_send(&self, owner: OwnerId, email: &str) -> Result<(), QuotaError> {
        let result = sqlx::query(
            "UPDATE sender_accounts
             SET sent_count = sent_count + 1, updated_at = now()
             WHERE owner_id = $1 AND email = $2",
        )
        .bind(*owner.as_ref())
        .bind(email)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuotaError::UnknownSender {
                email: email.to_owned(),
            });
        }
        Ok(())
    }

    #[tracing::instrument(name = "Collect account stats", skip(self))]
    async fn stats(&self, owner: OwnerId) -> Result<Vec<AccountStats>, QuotaError> {
        self.reset_if_stale(owner).await?;

        let rows = sqlx::query_as::<_, SenderAccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM sender_accounts
             WHERE owner_id = $1
             ORDER BY created_at"
        ))
        .bind(*owner.as_ref())
        .fetch_all(&self.pool)
        .await?;

        let limit = self.daily_limit;
        Ok(rows
            .into_iter()
            .map(|row| {
                let sent = row.sent_count.max(0) as u32;
                AccountStats {
                    id: row.id,
                    email: row.email,
                    sent_today: row.sent_count,
                    remaining: if row.is_active {
                        limit.saturating_sub(sent)
                    } else {
                        0
                    },
                    limit,
                    percentage_used: (sent as f32 / limit as f32) * 100.0,
                    is_active: row.is_active,
                    default_cc: row.default_cc,
                    default_bcc: row.default_bcc,
                    created_at: row.created_at,
                }
            })
            .collect())
    }
}
