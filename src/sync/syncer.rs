use std::sync::Arc;

use chrono::{Duration, Local, NaiveDate, Utc};

use crate::error::Result;
use crate::range::DateRange;
use crate::storage::{repository, Database};
use crate::sync::client::{ConnectionParams, ReportingClient};
use crate::sync::reconcile::{reconcile_campaigns, reconcile_daily_metrics, ReconcileResult};
use crate::sync::staleness::{should_sync, timestamp};
use crate::sync::{
    ActivityLog, NoopProgress, SyncOptions, SyncOutcome, SyncProgress, SyncStage,
    DEFAULT_WINDOW_DAYS,
};

/// Steps of the metrics stage. Campaigns are bootstrapped at most once.
enum MetricsStep {
    EnsureCampaigns { bootstrapped: bool },
    Fetch { campaign_ids: Vec<String> },
}

/// Syncs one account's campaigns and daily metrics into the local store.
///
/// Stage methods never return errors: every failure ends up in the
/// returned [`SyncOutcome`] and in the activity log.
pub struct AccountSyncer {
    db: Database,
    account_id: String,
    params: ConnectionParams,
    client: Arc<dyn ReportingClient>,
    lock: Arc<tokio::sync::Mutex<()>>,
    progress: Arc<dyn SyncProgress>,
    activity: ActivityLog,
    default_window_days: u32,
}

impl AccountSyncer {
    pub fn new(
        db: Database,
        account_id: &str,
        params: ConnectionParams,
        client: Arc<dyn ReportingClient>,
    ) -> Self {
        Self {
            db,
            account_id: account_id.to_string(),
            params,
            client,
            lock: Arc::default(),
            progress: Arc::new(NoopProgress),
            activity: ActivityLog::default(),
            default_window_days: DEFAULT_WINDOW_DAYS,
        }
    }

    /// Share a lock with other syncers for the same account.
    pub fn with_lock(mut self, lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_activity_log(mut self, activity: ActivityLog) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_default_window_days(mut self, days: u32) -> Self {
        self.default_window_days = days.max(1);
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn client(&self) -> &dyn ReportingClient {
        self.client.as_ref()
    }

    pub fn activity_log(&self) -> &ActivityLog {
        &self.activity
    }

    /// Fetch all remote campaigns and upsert them.
    pub async fn sync_campaigns(&self) -> SyncOutcome {
        let _guard = self.lock.lock().await;
        self.logged(self.campaign_stage().await)
    }

    /// Fetch daily metrics for the account's local campaigns over `range`
    /// (the default trailing window when `None`). Campaigns are synced
    /// first if none are stored yet.
    pub async fn sync_metrics(&self, range: Option<DateRange>) -> SyncOutcome {
        let _guard = self.lock.lock().await;
        let range = range.unwrap_or_else(|| DateRange::trailing(self.default_window_days, today()));
        self.logged(self.metrics_stage(range, true).await)
    }

    /// Campaigns then metrics. A failure in either stage is recorded and
    /// does not prevent the other from running.
    pub async fn perform_full_sync(&self, options: &SyncOptions) -> SyncOutcome {
        let _guard = self.lock.lock().await;
        self.windowed_full_sync(options).await
    }

    /// [`perform_full_sync`](Self::perform_full_sync) unless the cache is
    /// younger than `max_age`, judged after taking the account lock. A caller
    /// that waited behind another sync of the same account gets a skipped
    /// outcome instead of repeating the remote calls.
    pub async fn perform_full_sync_if_stale(
        &self,
        options: &SyncOptions,
        max_age: Duration,
    ) -> SyncOutcome {
        let _guard = self.lock.lock().await;
        match should_sync(&self.db, &self.account_id, max_age).await {
            Ok(false) => {
                log::info!("Skipping {}: cache is fresh", self.account_id);
                return SyncOutcome::skipped(&self.account_id, SyncStage::FullSync);
            }
            Ok(true) => {}
            Err(e) => log::warn!("Staleness check failed for {}: {e}", self.account_id),
        }
        self.windowed_full_sync(options).await
    }

    /// Full sync over the last `years_back` years, fetched in month batches.
    /// Zero years is rejected with a failed outcome.
    pub async fn sync_historical_data(&self, years_back: u32) -> SyncOutcome {
        let _guard = self.lock.lock().await;
        if years_back == 0 {
            return self.logged(SyncOutcome::failed(
                &self.account_id,
                SyncStage::HistoricalSync,
                "historical sync needs at least one year",
            ));
        }
        let range = DateRange::years_back(years_back, today());
        log::info!("Historical sync for {} over {range}", self.account_id);
        self.full_sync(SyncStage::HistoricalSync, range).await
    }

    async fn windowed_full_sync(&self, options: &SyncOptions) -> SyncOutcome {
        match options.metrics_range(today(), self.default_window_days) {
            Ok(range) => self.full_sync(SyncStage::FullSync, range).await,
            Err(e) => self.logged(SyncOutcome::failed(&self.account_id, SyncStage::FullSync, e)),
        }
    }

    async fn full_sync(&self, stage: SyncStage, range: DateRange) -> SyncOutcome {
        let mut outcome = SyncOutcome::start(&self.account_id, stage);

        let campaigns = self.logged(self.campaign_stage().await);
        outcome.campaigns_written = campaigns.campaigns_written;
        outcome.errors.extend(campaigns.errors);

        // The campaign stage just ran; a second fetch would not fare better.
        let metrics = self.logged(self.metrics_stage(range, false).await);
        outcome.metrics_written = metrics.metrics_written;
        outcome.errors.extend(metrics.errors);

        let outcome = outcome.finish();
        self.record_health(&outcome).await;
        log::info!(
            "{} for {}: {} campaigns, {} metric rows, {} errors ({}ms)",
            stage.as_str(),
            self.account_id,
            outcome.campaigns_written,
            outcome.metrics_written,
            outcome.errors.len(),
            outcome.duration_ms()
        );
        self.logged(outcome)
    }

    async fn campaign_stage(&self) -> SyncOutcome {
        let mut outcome = SyncOutcome::start(&self.account_id, SyncStage::Campaigns);

        let remote = match self.client.list_campaigns(&self.params).await {
            Ok(listing) => {
                outcome.errors.extend(listing.rejected);
                listing.records
            }
            Err(e) => {
                log::error!("Campaign fetch failed for {}: {e}", self.account_id);
                outcome.errors.push(format!("campaign fetch failed: {e}"));
                return outcome.finish();
            }
        };
        log::debug!("Fetched {} campaigns for {}", remote.len(), self.account_id);
        self.progress.on_campaigns_fetched(&self.account_id, remote.len());

        let account_id = self.account_id.clone();
        let synced_at = timestamp(Utc::now());
        let result = self
            .db
            .writer()
            .call(move |conn| reconcile_campaigns(conn, &account_id, &remote, &synced_at))
            .await;
        match result {
            Ok(result) => absorb(&mut outcome, result, |o, n| o.campaigns_written += n),
            Err(e) => outcome.errors.push(format!("campaign write failed: {e}")),
        }
        outcome.finish()
    }

    async fn metrics_stage(&self, range: DateRange, allow_bootstrap: bool) -> SyncOutcome {
        let mut outcome = SyncOutcome::start(&self.account_id, SyncStage::Metrics);
        let mut step = MetricsStep::EnsureCampaigns {
            bootstrapped: !allow_bootstrap,
        };

        loop {
            step = match step {
                MetricsStep::EnsureCampaigns { bootstrapped } => {
                    let campaign_ids = match self.local_campaign_ids().await {
                        Ok(ids) => ids,
                        Err(e) => {
                            outcome.errors.push(format!("campaign lookup failed: {e}"));
                            return outcome.finish();
                        }
                    };
                    if !campaign_ids.is_empty() {
                        MetricsStep::Fetch { campaign_ids }
                    } else if bootstrapped {
                        log::info!("No campaigns for {}; no metrics to sync", self.account_id);
                        return outcome.finish();
                    } else {
                        log::info!("No local campaigns for {}; syncing campaigns first", self.account_id);
                        let campaigns = self.logged(self.campaign_stage().await);
                        outcome.campaigns_written += campaigns.campaigns_written;
                        if !campaigns.errors.is_empty() && campaigns.campaigns_written == 0 {
                            outcome.errors.extend(campaigns.errors);
                            return outcome.finish();
                        }
                        outcome.errors.extend(campaigns.errors);
                        MetricsStep::EnsureCampaigns { bootstrapped: true }
                    }
                }
                MetricsStep::Fetch { campaign_ids } => {
                    self.fetch_metrics(&campaign_ids, range, &mut outcome).await;
                    return outcome.finish();
                }
            }
        }
    }

    /// Month-sized batches; a failed fetch ends the stage, earlier batches stay written.
    async fn fetch_metrics(&self, campaign_ids: &[String], range: DateRange, outcome: &mut SyncOutcome) {
        for batch in range.split_into_months() {
            let rows = match self
                .client
                .list_daily_metrics(&self.params, campaign_ids, batch.start, batch.end)
                .await
            {
                Ok(listing) => {
                    outcome.errors.extend(listing.rejected);
                    listing.records
                }
                Err(e) => {
                    log::error!("Metric fetch failed for {} ({batch}): {e}", self.account_id);
                    outcome.errors.push(format!("metric fetch failed for {batch}: {e}"));
                    return;
                }
            };
            log::debug!("Fetched {} metric rows for {} ({batch})", rows.len(), self.account_id);
            self.progress.on_metrics_fetched(&self.account_id, &batch, rows.len());

            let account_id = self.account_id.clone();
            let synced_at = timestamp(Utc::now());
            let result = self
                .db
                .writer()
                .call(move |conn| reconcile_daily_metrics(conn, &account_id, &rows, &synced_at))
                .await;
            match result {
                Ok(result) => absorb(outcome, result, |o, n| o.metrics_written += n),
                Err(e) => {
                    outcome.errors.push(format!("metric write failed for {batch}: {e}"));
                    return;
                }
            }
        }
    }

    async fn local_campaign_ids(&self) -> Result<Vec<String>> {
        let account_id = self.account_id.clone();
        let ids = self
            .db
            .reader()
            .call(move |conn| repository::campaign_ids_by_remote(conn, &account_id))
            .await?;
        let mut ids: Vec<String> = ids.into_keys().collect();
        ids.sort();
        Ok(ids)
    }

    async fn record_health(&self, outcome: &SyncOutcome) {
        let account_id = self.account_id.clone();
        let attempted_at = timestamp(outcome.completed_at);
        let error = outcome.errors.first().cloned();
        let result = self
            .db
            .writer()
            .call(move |conn| {
                repository::record_sync_health(conn, &account_id, &attempted_at, error.as_deref())
            })
            .await;
        if let Err(e) = result {
            log::warn!("Failed to record sync health for {}: {e}", self.account_id);
        }
    }

    fn logged(&self, outcome: SyncOutcome) -> SyncOutcome {
        self.activity.record(&self.db, &outcome);
        outcome
    }
}

fn absorb(outcome: &mut SyncOutcome, result: ReconcileResult, count: impl FnOnce(&mut SyncOutcome, u64)) {
    count(outcome, result.written);
    outcome.errors.extend(result.errors);
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
