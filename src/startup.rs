use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::campaign::{
    CampaignError, CampaignHandle, CampaignRequest, Dispatcher, DispatchState, PgCampaignStore,
    StatusRegistry,
};
use crate::configuration::{DatabaseSettings, Settings};
use crate::domain::OwnerId;
use crate::quota::{AccountStats, PgQuotaStore, QuotaError, QuotaStore};

/// The assembled engine: quota store, mail client, campaign log store and
/// the per-owner status registry behind one facade.
pub struct Engine {
    dispatcher: Dispatcher,
    registry: Arc<StatusRegistry>,
    accounts: Arc<PgQuotaStore>,
    history: Arc<PgCampaignStore>,
}

impl Engine {
    pub fn build(config: Settings) -> Self {
        let pool = get_connection_pool(&config.database);
        let accounts = Arc::new(PgQuotaStore::new(
            pool.clone(),
            config.engine.daily_send_limit,
        ));
        let history = Arc::new(PgCampaignStore::new(pool));
        let transport = Arc::new(config.mail_client.client());
        let registry = Arc::new(StatusRegistry::new());

        let dispatcher = Dispatcher::new(
            accounts.clone(),
            transport,
            history.clone(),
            registry.clone(),
            config.engine.quota_overflow,
        );

        Self {
            dispatcher,
            registry,
            accounts,
            history,
        }
    }

    /// Launch a campaign for `owner`. Returns as soon as setup validation
    /// passes and the background loop is spawned.
    pub async fn start_campaign(
        &self,
        owner: OwnerId,
        request: CampaignRequest,
    ) -> Result<CampaignHandle, CampaignError> {
        self.dispatcher.start(owner, request).await
    }

    /// Read-only progress snapshot for polling UIs.
    pub fn status(&self, owner: OwnerId) -> Option<DispatchState> {
        self.registry.snapshot(owner)
    }

    /// Signal the owner's running campaign to stop.
    pub fn cancel(&self, owner: OwnerId) -> bool {
        self.registry.cancel(owner)
    }

    pub async fn account_stats(&self, owner: OwnerId) -> Result<Vec<AccountStats>, QuotaError> {
        self.accounts.stats(owner).await
    }

    /// Owner-scoped sender account management.
    pub fn accounts(&self) -> &PgQuotaStore {
        &self.accounts
    }

    /// Read access to persisted campaign logs.
    pub fn history(&self) -> &PgCampaignStore {
        &self.history
    }
}

pub fn get_connection_pool(db_config: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(2))
        .connect_lazy_with(db_config.with_db())
}
