pub mod config;
pub mod date_util;
pub mod error;
pub mod metrics;
pub mod models;
pub mod period;
pub mod range;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use chrono::Utc;

pub use config::SyncSettings;
pub use error::{Error, Result};
pub use metrics::{AggregatedView, CampaignBreakdown, DailyPoint, MetricTotals, Provenance};
pub use models::{AccountStatus, CampaignStatus};
pub use period::Period;
pub use range::DateRange;
pub use storage::Database;
pub use sync::client::{ClientFactory, ConnectionParams, CredentialResolver, ReportingClient};
pub use sync::http::HttpClientFactory;
pub use sync::syncer::AccountSyncer;
pub use sync::{NoopProgress, SyncOptions, SyncOutcome, SyncProgress, SyncStage, SyncStatus};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{AccountConfig, SyncHealth, SyncLogEntry};

use storage::repository;
use sync::client::StoredCredentialResolver;
use sync::{staleness, AccountLocks, ActivityLog};

/// Main entry point: account management, sync orchestration and the
/// aggregated read path over one local cache.
pub struct AdCache {
    db: Database,
    resolver: Arc<dyn CredentialResolver>,
    clients: Arc<dyn ClientFactory>,
    locks: AccountLocks,
    activity: ActivityLog,
}

impl AdCache {
    pub fn new(
        db: Database,
        resolver: Arc<dyn CredentialResolver>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            db,
            resolver,
            clients,
            locks: AccountLocks::default(),
            activity: ActivityLog::default(),
        }
    }

    /// Credentials come from the `account_configs` table.
    pub fn with_stored_credentials(db: Database, clients: Arc<dyn ClientFactory>) -> Self {
        let resolver = Arc::new(StoredCredentialResolver::new(db.clone()));
        Self::new(db, resolver, clients)
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub async fn settings(&self) -> Result<SyncSettings> {
        SyncSettings::load(&self.db).await
    }

    // ── Sync commands ──────────────────────────────────────────────

    /// Resolve credentials and build a syncer for one account. This is the
    /// only sync entry point that returns setup failures as `Err`.
    pub async fn syncer(&self, account_id: &str) -> Result<AccountSyncer> {
        let params = self.resolver.resolve(account_id).await?;
        let client = self.clients.build(&params)?;
        let settings = self.settings().await?;
        Ok(AccountSyncer::new(self.db.clone(), account_id, params, client)
            .with_lock(self.locks.for_account(account_id))
            .with_activity_log(self.activity.clone())
            .with_default_window_days(settings.default_window_days))
    }

    /// True iff the account has never been synced or its newest campaign
    /// sync is older than the configured max age.
    pub async fn should_sync(&self, account_id: &str) -> Result<bool> {
        let settings = self.settings().await?;
        staleness::should_sync(&self.db, account_id, settings.max_age).await
    }

    pub async fn sync_account(&self, account_id: &str, options: &SyncOptions) -> Result<SyncOutcome> {
        Ok(self.syncer(account_id).await?.perform_full_sync(options).await)
    }

    pub async fn sync_historical(&self, account_id: &str, years_back: u32) -> Result<SyncOutcome> {
        Ok(self.syncer(account_id).await?.sync_historical_data(years_back).await)
    }

    /// Full sync of every active account, one after another. Accounts that
    /// cannot be resolved get a failed outcome; fresh accounts are skipped
    /// unless `options.force` is set. If the account list itself cannot be
    /// read, the error is logged and no outcomes are returned.
    pub async fn sync_all_configurations(
        &self,
        options: &SyncOptions,
        progress: Arc<dyn SyncProgress>,
    ) -> Vec<SyncOutcome> {
        let account_ids: Vec<String> = match self
            .db
            .reader()
            .call(|conn| repository::list_active_account_ids(conn))
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("Cannot list accounts to sync: {e}");
                return Vec::new();
            }
        };

        let total = account_ids.len();
        let mut outcomes = Vec::with_capacity(total);
        for (i, account_id) in account_ids.iter().enumerate() {
            progress.on_account_start(account_id, i, total);

            let outcome = self.sync_one(account_id, options, progress.clone()).await;
            progress.on_account_complete(&outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn sync_one(
        &self,
        account_id: &str,
        options: &SyncOptions,
        progress: Arc<dyn SyncProgress>,
    ) -> SyncOutcome {
        if !options.force {
            match self.should_sync(account_id).await {
                Ok(false) => {
                    log::info!("Skipping {account_id}: cache is fresh");
                    return SyncOutcome::skipped(account_id, SyncStage::FullSync);
                }
                Ok(true) => {}
                Err(e) => log::warn!("Staleness check failed for {account_id}: {e}"),
            }
        }

        match self.syncer(account_id).await {
            Ok(syncer) => {
                let syncer = syncer.with_progress(progress);
                match (options.force, self.settings().await) {
                    (false, Ok(settings)) => {
                        syncer.perform_full_sync_if_stale(options, settings.max_age).await
                    }
                    _ => syncer.perform_full_sync(options).await,
                }
            }
            Err(e) => {
                log::error!("Failed to sync {account_id}: {e}");
                let outcome = SyncOutcome::failed(account_id, SyncStage::FullSync, &e);
                self.record_failed_attempt(&outcome).await;
                outcome
            }
        }
    }

    async fn record_failed_attempt(&self, outcome: &SyncOutcome) {
        let account_id = outcome.account_id.clone();
        let attempted_at = staleness::timestamp(outcome.completed_at);
        let error = outcome.errors.first().cloned();
        let result = self
            .db
            .writer()
            .call(move |conn| {
                repository::record_sync_health(conn, &account_id, &attempted_at, error.as_deref())
            })
            .await;
        if let Err(e) = result {
            log::warn!("Failed to record sync health for {}: {e}", outcome.account_id);
        }
    }

    /// Wait for pending activity-log writes. Call before shutting down.
    pub async fn flush_activity(&self) {
        self.activity.flush().await;
    }

    // ── Read path ──────────────────────────────────────────────────

    /// Aggregated metrics for one account over `range`.
    ///
    /// Refreshes first when the cache is stale (or `force_refresh`); refresh
    /// failures are logged and the cached data is served. With no cached
    /// campaigns at all, the view is computed from a live fetch that is not
    /// persisted, and its failures are returned.
    pub async fn get_metrics(
        &self,
        account_id: &str,
        range: DateRange,
        force_refresh: bool,
    ) -> Result<AggregatedView> {
        let settings = self.settings().await?;
        let due =
            force_refresh || staleness::should_sync(&self.db, account_id, settings.max_age).await?;
        if due {
            match self.syncer(account_id).await {
                Ok(syncer) => {
                    let options = SyncOptions::default();
                    let outcome = if force_refresh {
                        syncer.perform_full_sync(&options).await
                    } else {
                        // Concurrent readers queue on the account lock; only the first syncs
                        syncer.perform_full_sync_if_stale(&options, settings.max_age).await
                    };
                    if !outcome.success() {
                        log::warn!(
                            "Refresh for {account_id} finished with {} errors; serving cache",
                            outcome.errors.len()
                        );
                    }
                }
                Err(e) => log::warn!("Refresh for {account_id} not possible: {e}"),
            }
        }

        if let Some(view) = metrics::cached_view(&self.db, account_id, range, Utc::now()).await? {
            return Ok(view);
        }

        log::info!("No cached campaigns for {account_id}; using live fallback");
        let syncer = self.syncer(account_id).await?;
        metrics::live_view(syncer.client(), syncer.params(), account_id, range).await
    }

    // ── Account commands ───────────────────────────────────────────

    pub async fn add_account(
        &self,
        account_id: &str,
        display_name: Option<&str>,
        params: &ConnectionParams,
    ) -> Result<()> {
        let connection_json = serde_json::to_string(params)
            .map_err(|e| Error::Config(format!("cannot encode connection parameters: {e}")))?;
        self.db
            .writer()
            .call({
                let account_id = account_id.to_string();
                let display_name = display_name.map(str::to_string);
                move |conn| {
                    repository::upsert_account_config(
                        conn,
                        &account_id,
                        display_name.as_deref(),
                        AccountStatus::Active,
                        &connection_json,
                    )
                }
            })
            .await?;
        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<AccountConfig>> {
        let account_id = account_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_account_config(conn, &account_id))
            .await?)
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountConfig>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_account_configs(conn))
            .await?)
    }

    pub async fn set_account_status(&self, account_id: &str, status: AccountStatus) -> Result<()> {
        let updated = self
            .db
            .writer()
            .call({
                let account_id = account_id.to_string();
                move |conn| repository::set_account_status(conn, &account_id, status)
            })
            .await?;
        if !updated {
            return Err(Error::NotFound(format!("account {account_id}")));
        }
        Ok(())
    }

    pub async fn remove_account(&self, account_id: &str) -> Result<bool> {
        let account_id = account_id.to_string();
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::remove_account_config(conn, &account_id))
            .await?)
    }

    pub async fn account_health(&self, account_id: &str) -> Result<Option<SyncHealth>> {
        let account_id = account_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_sync_health(conn, &account_id))
            .await?)
    }

    pub async fn recent_activity(&self, limit: u32) -> Result<Vec<SyncLogEntry>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::list_recent_sync_log(conn, limit))
            .await?)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await?)
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        config::validate(key, value)?;
        let key = key.to_string();
        let value = value.trim().to_string();
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::set_config(conn, &key, &value))
            .await?)
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?)
    }
}
