use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::campaign::dispatch::SenderMode;
use crate::campaign::state::DispatchState;
use crate::domain::OwnerId;

/// Immutable snapshot of a completed campaign. Written once, at completion;
/// the only durability point of a batch.
#[derive(Debug, Clone)]
pub struct CampaignLog {
    pub owner: OwnerId,
    pub sender_mode: SenderMode,
    pub total_emails: u32,
    pub sent_count: u32,
    pub failed_count: u32,
    pub duration_seconds: f64,
    pub subject: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachment_name: Option<String>,
    pub rotation: BTreeMap<String, u32>,
    pub halted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecipientOutcome {
    pub recipient: String,
    pub sender: String,
    pub status: OutcomeStatus,
    pub error: Option<String>,
}

impl CampaignLog {
    /// Assemble the log and its outcome rows from the final dispatch state.
    pub fn from_state(
        owner: OwnerId,
        sender_mode: SenderMode,
        subject: String,
        state: &DispatchState,
        duration_seconds: f64,
        halted: bool,
    ) -> (Self, Vec<RecipientOutcome>) {
        let mut outcomes = Vec::with_capacity(state.succeeded.len() + state.failures.len());
        for sent in &state.succeeded {
            outcomes.push(RecipientOutcome {
                recipient: sent.recipient.clone(),
                sender: sent.sender.clone(),
                status: OutcomeStatus::Success,
                error: None,
            });
        }
        for failure in &state.failures {
            outcomes.push(RecipientOutcome {
                recipient: failure.recipient.clone(),
                sender: failure.sender.clone(),
                status: OutcomeStatus::Failed,
                error: Some(failure.error.clone()),
            });
        }

        let log = Self {
            owner,
            sender_mode,
            total_emails: state.total,
            sent_count: state.sent,
            failed_count: state.failed,
            duration_seconds,
            subject,
            cc: state.cc.clone(),
            bcc: state.bcc.clone(),
            attachment_name: state.attachment_name.clone(),
            rotation: state.rotation.clone(),
            halted,
        };

        (log, outcomes)
    }
}

/// Append-only store for completed campaigns and their per-recipient audit
/// rows.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn persist(
        &self,
        log: &CampaignLog,
        outcomes: &[RecipientOutcome],
    ) -> Result<Uuid, anyhow::Error>;
}

#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
pub struct CampaignLogRecord {
    pub id: Uuid,
    pub sender_mode: String,
    pub total_emails: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub duration_seconds: f64,
    pub subject: String,
    pub cc_emails: String,
    pub bcc_emails: String,
    pub attachment_name: Option<String>,
    pub rotation: serde_json::Value,
    pub halted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct OutcomeRecord {
    pub recipient_email: String,
    pub sender_email: String,
    pub status: String,
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent campaigns for an owner, newest first.
    #[tracing::instrument(name = "List recent campaign logs", skip(self))]
    pub async fn recent(
        &self,
        owner: OwnerId,
        limit: i64,
    ) -> Result<Vec<CampaignLogRecord>, sqlx::Error> {
        sqlx::query_as::<_, CampaignLogRecord>(
            "SELECT id, sender_mode, total_emails, sent_count, failed_count,
                    duration_seconds, subject, cc_emails, bcc_emails,
                    attachment_name, rotation, halted, created_at
             FROM campaign_logs
             WHERE owner_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(*owner.as_ref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Per-recipient rows of one campaign, in send order. Owner-scoped so a
    /// tenant cannot read another tenant's audit trail.
    #[tracing::instrument(name = "Read campaign outcomes", skip(self))]
    pub async fn outcomes(
        &self,
        owner: OwnerId,
        log_id: Uuid,
    ) -> Result<Vec<OutcomeRecord>, sqlx::Error> {
        sqlx::query_as::<_, OutcomeRecord>(
            "SELECT o.recipient_email, o.sender_email, o.status, o.error_message, o.sent_at
             FROM recipient_outcomes o
             JOIN campaign_logs l ON l.id = o.log_id
             WHERE o.log_id = $1 AND l.owner_id = $2
             ORDER BY o.sent_at, o.id",
        )
        .bind(log_id)
        .bind(*owner.as_ref())
        .fetch_all(&self.pool)
        .await
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    #[tracing::instrument(name = "Persist campaign log", skip(self, log, outcomes))]
    async fn persist(
        &self,
        log: &CampaignLog,
        outcomes: &[RecipientOutcome],
    ) -> Result<Uuid, anyhow::Error> {
        use anyhow::Context;

        let log_id = Uuid::new_v4();
        let rotation =
            serde_json::to_value(&log.rotation).context("Failed to serialize rotation map")?;

        let mut transaction = self
            .pool
            .begin()
            .await
            .context("Failed to open a transaction")?;

        sqlx::query(
            "INSERT INTO campaign_logs
                 (id, owner_id, sender_mode, total_emails, sent_count, failed_count,
                  duration_seconds, subject, cc_emails, bcc_emails, attachment_name,
                  rotation, halted)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(log_id)
        .bind(*log.owner.as_ref())
        .bind(log.sender_mode.as_str())
        .bind(log.total_emails as i32)
        .bind(log.sent_count as i32)
        .bind(log.failed_count as i32)
        .bind(log.duration_seconds)
        .bind(&log.subject)
        .bind(log.cc.join(", "))
        .bind(log.bcc.join(", "))
        .bind(&log.attachment_name)
        .bind(rotation)
        .bind(log.halted)
        .execute(&mut *transaction)
        .await
        .context("Failed to insert campaign log")?;

        for outcome in outcomes {
            sqlx::query(
                "INSERT INTO recipient_outcomes
                     (log_id, recipient_email, sender_email, status, error_message)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(log_id)
            .bind(&outcome.recipient)
            .bind(&outcome.sender)
            .bind(outcome.status.as_str())
            .bind(&outcome.error)
            .execute(&mut *transaction)
            .await
            .context("Failed to insert recipient outcome")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit campaign log")?;

        Ok(log_id)
    }
}
