mod dispatch;
mod log;
mod state;

pub use dispatch::{
    CampaignError, CampaignHandle, CampaignRequest, CampaignSummary, Dispatcher, SenderMode,
};
pub use log::{
    CampaignLog, CampaignLogRecord, CampaignStore, OutcomeRecord, OutcomeStatus, PgCampaignStore,
    RecipientOutcome,
};
pub use state::{DispatchState, FailedRecipient, SentRecipient, StatusRegistry};
