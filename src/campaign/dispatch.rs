use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::campaign::log::{CampaignLog, CampaignStore};
use crate::campaign::state::{
    DispatchState, FailedRecipient, RunGuard, SentRecipient, StatusRegistry,
};
use crate::configuration::QuotaOverflow;
use crate::domain::{OwnerId, merge_address_lists};
use crate::error_chain_fmt;
use crate::normalize::{
    NormalizeError, Recipient, RecipientSource, SourceUnavailable, normalize_recipients,
};
use crate::quota::{QuotaError, QuotaStore};
use crate::render::{html_body, render_template};
use crate::selector::{SelectError, SelectedSender, SenderRotation, verify_pinned};
use crate::transport::{Attachment, MailTransport, OutgoingEmail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderMode {
    Auto,
    Manual,
}

impl SenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderMode::Auto => "auto",
            SenderMode::Manual => "manual",
        }
    }
}

impl std::fmt::Display for SenderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot description of a campaign. Immutable once the loop starts.
pub struct CampaignRequest {
    pub source: Arc<dyn RecipientSource>,
    pub email_column: String,
    pub subject: String,
    pub body: String,
    pub mode: SenderMode,
    /// Required iff `mode` is manual.
    pub pinned_sender: Option<String>,
    /// Anti-abuse throttle applied after every recipient, success or not.
    pub delay: Duration,
    pub cc: String,
    pub bcc: String,
    pub attachment: Option<Attachment>,
}

#[derive(thiserror::Error)]
pub enum CampaignError {
    #[error("a campaign is already running for this owner")]
    AlreadyRunning,
    #[error(transparent)]
    Source(#[from] SourceUnavailable),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("no sender accounts registered - add an email account first")]
    NoAccounts,
    #[error("manual mode requires selecting a sender account")]
    NoPinnedSender,
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

impl std::fmt::Debug for CampaignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Operator-facing completion summary. Full detail lives in the persisted
/// log.
#[derive(Debug, Clone)]
pub struct CampaignSummary {
    pub total: u32,
    pub sent: u32,
    pub failed: u32,
    pub duration: Duration,
    pub halted: bool,
    pub cancelled: bool,
    pub rotation: BTreeMap<String, u32>,
    /// Up to the first five `"recipient: error"` strings for triage.
    pub first_failures: Vec<String>,
}

#[derive(Debug)]
pub struct CampaignHandle {
    join: JoinHandle<CampaignSummary>,
    cancel: CancellationToken,
}

impl CampaignHandle {
    /// Ask the loop to stop after the current recipient. Partial results are
    /// still persisted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<CampaignSummary, tokio::task::JoinError> {
        self.join.await
    }
}

pub struct Dispatcher {
    quota: Arc<dyn QuotaStore>,
    transport: Arc<dyn MailTransport>,
    store: Arc<dyn CampaignStore>,
    registry: Arc<StatusRegistry>,
    overflow: QuotaOverflow,
}

impl Dispatcher {
    pub fn new(
        quota: Arc<dyn QuotaStore>,
        transport: Arc<dyn MailTransport>,
        store: Arc<dyn CampaignStore>,
        registry: Arc<StatusRegistry>,
        overflow: QuotaOverflow,
    ) -> Self {
        Self {
            quota,
            transport,
            store,
            registry,
            overflow,
        }
    }

    /// Validate the request and spawn the dispatch loop as a background
    /// task.
    ///
    /// Setup errors (unreadable source, missing email column, zero valid
    /// recipients, no registered accounts, manual sender unusable or short
    /// on quota, campaign already running) surface here, before any send.
    #[tracing::instrument(name = "Start campaign", skip(self, request), fields(mode = %request.mode))]
    pub async fn start(
        &self,
        owner: OwnerId,
        request: CampaignRequest,
    ) -> Result<CampaignHandle, CampaignError> {
        let sheet = request.source.parse()?;
        let recipients = normalize_recipients(&sheet, &request.email_column)?;

        self.quota.reset_if_stale(owner).await?;
        if self.quota.list_active(owner).await?.is_empty() {
            return Err(CampaignError::NoAccounts);
        }

        let pinned = match request.mode {
            SenderMode::Auto => None,
            SenderMode::Manual => {
                let email = request
                    .pinned_sender
                    .as_deref()
                    .filter(|e| !e.is_empty())
                    .ok_or(CampaignError::NoPinnedSender)?;
                Some(
                    verify_pinned(self.quota.as_ref(), owner, email, recipients.len() as u32)
                        .await?,
                )
            }
        };

        let guard = self
            .registry
            .begin(owner)
            .ok_or(CampaignError::AlreadyRunning)?;

        guard.update(|state| {
            *state = DispatchState {
                is_sending: true,
                total: recipients.len() as u32,
                started_at: Some(Utc::now()),
                attachment_name: request.attachment.as_ref().map(|a| a.filename.clone()),
                ..DispatchState::default()
            };
        });

        let cancel = guard.cancellation();
        let worker = Worker {
            quota: self.quota.clone(),
            transport: self.transport.clone(),
            store: self.store.clone(),
            overflow: self.overflow,
            owner,
            request,
            recipients,
            pinned,
            guard,
        };

        let span = tracing::info_span!("Campaign dispatch", %owner);
        let join = tokio::spawn(worker.run().instrument(span));

        Ok(CampaignHandle { join, cancel })
    }
}

struct Worker {
    quota: Arc<dyn QuotaStore>,
    transport: Arc<dyn MailTransport>,
    store: Arc<dyn CampaignStore>,
    overflow: QuotaOverflow,
    owner: OwnerId,
    request: CampaignRequest,
    recipients: Vec<Recipient>,
    pinned: Option<SelectedSender>,
    guard: RunGuard,
}

impl Worker {
    async fn run(self) -> CampaignSummary {
        let started = Instant::now();
        let cancel = self.guard.cancellation();
        let mut rotation = SenderRotation::new(self.overflow);
        let mut halted = false;
        let mut cancelled = false;

        for recipient in &self.recipients {
            if cancel.is_cancelled() {
                tracing::warn!(recipient = %recipient.email, "Campaign cancelled by owner");
                cancelled = true;
                break;
            }

            self.guard
                .update(|state| state.current_recipient = recipient.email.clone());

            let sender = match &self.pinned {
                Some(sender) => sender.clone(),
                None => match rotation.next(self.quota.as_ref(), self.owner).await {
                    Ok(sender) => sender,
                    Err(e) => {
                        // Total sender unavailability is loop-fatal: halt,
                        // keep everything sent so far.
                        tracing::error!(error = ?e, "No sender available, halting campaign");
                        halted = true;
                        break;
                    }
                },
            };

            let (cc, bcc) = merge_address_lists(
                &self.request.cc,
                &self.request.bcc,
                &sender.default_cc,
                &sender.default_bcc,
            );
            self.guard.update(|state| {
                state.current_sender = sender.email.clone();
                state.cc = cc.clone();
                state.bcc = bcc.clone();
            });

            let subject = render_template(&self.request.subject, &recipient.row);
            let text = render_template(&self.request.body, &recipient.row);
            let html = html_body(&text);

            let outcome = self
                .transport
                .send(OutgoingEmail {
                    sender: &sender,
                    recipient: &recipient.email,
                    subject: &subject,
                    text_body: &text,
                    html_body: &html,
                    cc: &cc,
                    bcc: &bcc,
                    attachment: self.request.attachment.as_ref(),
                })
                .await;

            match outcome {
                Ok(()) => {
                    tracing::info!(recipient = %recipient.email, sender = %sender.email, "Email sent");
                    self.guard.update(|state| {
                        state.sent += 1;
                        state.succeeded.push(SentRecipient {
                            recipient: recipient.email.clone(),
                            sender: sender.email.clone(),
                        });
                        *state.rotation.entry(sender.email.clone()).or_insert(0) += 1;
                    });
                    rotation.note_sent();
                    if let Err(e) = self.quota.record_send(self.owner, &sender.email).await {
                        // The message already went out; under-counting beats
                        // aborting a half-finished batch.
                        tracing::warn!(error = ?e, sender = %sender.email, "Failed to record send");
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    tracing::warn!(recipient = %recipient.email, error = %error, "Send failed");
                    self.guard.update(|state| {
                        state.failed += 1;
                        state.failures.push(FailedRecipient {
                            recipient: recipient.email.clone(),
                            sender: sender.email.clone(),
                            error,
                        });
                    });
                }
            }

            // Throttle between recipients even after a failure.
            tokio::time::sleep(self.request.delay).await;
        }

        let duration = started.elapsed();
        self.guard.update(|state| {
            state.is_sending = false;
            state.current_recipient.clear();
        });

        let state = self.guard.snapshot();
        let (log, outcomes) = CampaignLog::from_state(
            self.owner,
            self.request.mode,
            self.request.subject.clone(),
            &state,
            duration.as_secs_f64(),
            halted || cancelled,
        );

        if let Err(e) = self.store.persist(&log, &outcomes).await {
            tracing::error!(error = ?e, "Failed to persist campaign log");
        }

        let summary = CampaignSummary {
            total: state.total,
            sent: state.sent,
            failed: state.failed,
            duration,
            halted,
            cancelled,
            rotation: state.rotation,
            first_failures: state
                .failures
                .iter()
                .take(5)
                .map(ToString::to_string)
                .collect(),
        };
        tracing::info!(
            sent = summary.sent,
            failed = summary.failed,
            duration_seconds = summary.duration.as_secs_f64(),
            "Campaign completed"
        );
        summary
    }
}
