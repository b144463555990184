use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::OwnerId;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SentRecipient {
    pub recipient: String,
    pub sender: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedRecipient {
    pub recipient: String,
    pub sender: String,
    pub error: String,
}

impl std::fmt::Display for FailedRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.recipient, self.error)
    }
}

/// Live progress of one owner's in-flight (or last finished) campaign.
/// Written only by the dispatch task; read concurrently via cloned
/// snapshots, so a progress display never observes a torn struct.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatchState {
    pub is_sending: bool,
    pub total: u32,
    pub sent: u32,
    pub failed: u32,
    pub current_recipient: String,
    pub current_sender: String,
    /// Messages sent per sender account within this campaign.
    pub rotation: BTreeMap<String, u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub succeeded: Vec<SentRecipient>,
    pub failures: Vec<FailedRecipient>,
    pub attachment_name: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

struct OwnerSlot {
    state: Mutex<DispatchState>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl OwnerSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState::default()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

/// Per-owner state container. At most one campaign may run per owner; a
/// second start is rejected instead of silently overwriting the first one's
/// progress.
#[derive(Default)]
pub struct StatusRegistry {
    slots: Mutex<HashMap<OwnerId, Arc<OwnerSlot>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, owner: OwnerId) -> Arc<OwnerSlot> {
        self.slots
            .lock()
            .entry(owner)
            .or_insert_with(|| Arc::new(OwnerSlot::new()))
            .clone()
    }

    /// Snapshot of the owner's campaign progress, or `None` if this owner
    /// never started one.
    pub fn snapshot(&self, owner: OwnerId) -> Option<DispatchState> {
        let slot = self.slots.lock().get(&owner).cloned()?;
        Some(slot.state.lock().clone())
    }

    /// Signal the owner's running campaign to stop after the current
    /// recipient. Returns whether a running campaign was signalled.
    pub fn cancel(&self, owner: OwnerId) -> bool {
        let Some(slot) = self.slots.lock().get(&owner).cloned() else {
            return false;
        };
        if !slot.running.load(Ordering::Acquire) {
            return false;
        }
        slot.cancel.lock().cancel();
        true
    }

    /// Claim the owner's slot for a new campaign. `None` if one is already
    /// running. The returned guard releases the slot on drop.
    pub(crate) fn begin(&self, owner: OwnerId) -> Option<RunGuard> {
        let slot = self.slot(owner);
        if slot
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let token = CancellationToken::new();
        *slot.cancel.lock() = token.clone();
        Some(RunGuard { slot, token })
    }
}

/// Exclusive write access to one owner's `DispatchState` for the duration of
/// a campaign.
pub(crate) struct RunGuard {
    slot: Arc<OwnerSlot>,
    token: CancellationToken,
}

impl RunGuard {
    pub(crate) fn update(&self, f: impl FnOnce(&mut DispatchState)) {
        f(&mut self.slot.state.lock());
    }

    pub(crate) fn snapshot(&self) -> DispatchState {
        self.slot.state.lock().clone()
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("running", &self.slot.running)
            .finish_non_exhaustive()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::Release);
    }
}
