use secrecy::SecretString;

use crate::configuration::QuotaOverflow;
use crate::domain::OwnerId;
use crate::error_chain_fmt;
use crate::quota::{QuotaError, QuotaStore, SenderAccount};

/// A sender resolved for dispatch: credential plus the account-level CC/BCC
/// defaults the merge step needs.
#[derive(Debug, Clone)]
pub struct SelectedSender {
    pub email: String,
    pub credential: SecretString,
    pub default_cc: String,
    pub default_bcc: String,
}

impl From<SenderAccount> for SelectedSender {
    fn from(account: SenderAccount) -> Self {
        Self {
            email: account.email,
            credential: account.credential,
            default_cc: account.default_cc,
            default_bcc: account.default_bcc,
        }
    }
}

#[derive(thiserror::Error)]
pub enum SelectError {
    #[error("no active sender accounts available - register or activate an account first")]
    NoSenderAvailable,
    #[error("every sender account has exhausted its daily quota")]
    AllExhausted,
    #[error("sender account {email} is not configured or inactive - select another account")]
    PinnedUnavailable { email: String },
    #[error(
        "sender account {email} has no capacity for this batch: {requested} requested, \
         {remaining} remaining today (short by {})",
        .requested - .remaining
    )]
    InsufficientQuota {
        email: String,
        requested: u32,
        remaining: u32,
    },
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

impl std::fmt::Debug for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Auto-rotation state for one campaign: the current sender and how many
/// messages have gone out through it.
pub struct SenderRotation {
    overflow: QuotaOverflow,
    current: Option<SelectedSender>,
    sent_with_current: u32,
}

impl SenderRotation {
    pub fn new(overflow: QuotaOverflow) -> Self {
        Self {
            overflow,
            current: None,
            sent_with_current: 0,
        }
    }

    /// The sender to use for the next message. Re-selects when no sender is
    /// set yet or the current one has carried `daily_limit` messages within
    /// this campaign.
    #[tracing::instrument(name = "Select sender", skip(self, store))]
    pub async fn next(
        &mut self,
        store: &dyn QuotaStore,
        owner: OwnerId,
    ) -> Result<SelectedSender, SelectError> {
        if let Some(current) = &self.current {
            if self.sent_with_current < store.daily_limit() {
                return Ok(current.clone());
            }
        }

        let selected = pick_least_used(store, owner, self.overflow).await?;
        tracing::info!(sender = %selected.email, "Rotating to sender account");
        self.sent_with_current = 0;
        self.current = Some(selected.clone());
        Ok(selected)
    }

    /// Record one confirmed send through the current sender.
    pub fn note_sent(&mut self) {
        self.sent_with_current += 1;
    }
}

async fn pick_least_used(
    store: &dyn QuotaStore,
    owner: OwnerId,
    overflow: QuotaOverflow,
) -> Result<SelectedSender, SelectError> {
    store.reset_if_stale(owner).await?;
    let limit = store.daily_limit();
    let accounts = store.list_active(owner).await?;

    if accounts.is_empty() {
        return Err(SelectError::NoSenderAvailable);
    }

    // Accounts arrive oldest-created first, so keeping the first strict
    // minimum gives the earliest-created tie-break.
    let mut best: Option<&SenderAccount> = None;
    for account in &accounts {
        if (account.sent_count.max(0) as u32) < limit {
            match best {
                Some(current) if account.sent_count >= current.sent_count => {}
                _ => best = Some(account),
            }
        }
    }

    if let Some(account) = best {
        return Ok(account.clone().into());
    }

    match overflow {
        QuotaOverflow::Soft => {
            let fallback = accounts[0].clone();
            tracing::warn!(
                sender = %fallback.email,
                limit,
                "Every account has reached its daily limit; continuing with the oldest account"
            );
            Ok(fallback.into())
        }
        QuotaOverflow::Hard => Err(SelectError::AllExhausted),
    }
}

/// Manual-mode preflight: the pinned sender must be active, owned by the
/// requester and able to cover the whole batch. Runs before any send, so a
/// short account rejects the campaign instead of stranding it mid-loop.
#[tracing::instrument(name = "Verify pinned sender", skip(store))]
pub async fn verify_pinned(
    store: &dyn QuotaStore,
    owner: OwnerId,
    email: &str,
    recipient_count: u32,
) -> Result<SelectedSender, SelectError> {
    store.reset_if_stale(owner).await?;

    let account = store
        .list_active(owner)
        .await?
        .into_iter()
        .find(|account| account.email == email)
        .ok_or_else(|| SelectError::PinnedUnavailable {
            email: email.to_owned(),
        })?;

    let remaining = store
        .daily_limit()
        .saturating_sub(account.sent_count.max(0) as u32);
    if remaining < recipient_count {
        return Err(SelectError::InsufficientQuota {
            email: email.to_owned(),
            requested: recipient_count,
            remaining,
        });
    }

    Ok(account.into())
}
