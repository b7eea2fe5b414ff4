pub mod client;
pub mod http;
pub mod reconcile;
pub mod staleness;
pub mod syncer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::range::DateRange;
use crate::storage::{repository, Database};

/// Default metrics window for routine syncs.
pub const DEFAULT_WINDOW_DAYS: u32 = 30;

/// Options controlling a sync operation.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// First day of the metrics window.
    pub since: Option<NaiveDate>,
    /// Last day of the metrics window (defaults to today).
    pub until: Option<NaiveDate>,
    /// Trailing window length, used when `since` is not set.
    pub days: Option<u32>,
    /// Fleet runs: sync accounts whose cache is still fresh.
    pub force: bool,
}

impl SyncOptions {
    /// The metrics window these options describe.
    pub fn metrics_range(&self, today: NaiveDate, default_days: u32) -> Result<DateRange> {
        let end = self.until.unwrap_or(today);
        match (self.since, self.days) {
            (Some(start), _) => DateRange::new(start, end),
            (None, Some(days)) => Ok(DateRange::trailing(days, end)),
            (None, None) => Ok(DateRange::trailing(default_days, end)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Campaigns,
    Metrics,
    FullSync,
    HistoricalSync,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Campaigns => "campaign_sync",
            SyncStage::Metrics => "metric_sync",
            SyncStage::FullSync => "full_sync",
            SyncStage::HistoricalSync => "historical_sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
    /// Fleet run left a fresh account alone.
    Skipped,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
            SyncStatus::Skipped => "skipped",
        }
    }
}

/// Result of one orchestration run for one account.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub account_id: String,
    pub stage: SyncStage,
    pub status: SyncStatus,
    pub campaigns_written: u64,
    pub metrics_written: u64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncOutcome {
    pub fn start(account_id: &str, stage: SyncStage) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.to_string(),
            stage,
            status: SyncStatus::Success,
            campaigns_written: 0,
            metrics_written: 0,
            errors: Vec::new(),
            started_at: now,
            completed_at: now,
        }
    }

    /// An outcome for an account whose sync could not even start.
    pub fn failed(account_id: &str, stage: SyncStage, error: impl ToString) -> Self {
        let mut outcome = Self::start(account_id, stage);
        outcome.errors.push(error.to_string());
        outcome.finish()
    }

    pub fn skipped(account_id: &str, stage: SyncStage) -> Self {
        let mut outcome = Self::start(account_id, stage);
        outcome.status = SyncStatus::Skipped;
        outcome
    }

    /// Stamp completion and derive the status from counts and errors.
    pub fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        let written = self.campaigns_written + self.metrics_written;
        self.status = if self.errors.is_empty() {
            SyncStatus::Success
        } else if written > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        self
    }

    /// True iff the run reported no errors at all.
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.status != SyncStatus::Failed
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }

    fn log_entry(&self) -> repository::SyncLogEntry {
        repository::SyncLogEntry {
            account_id: self.account_id.clone(),
            stage: self.stage.as_str().to_string(),
            status: self.status.as_str().to_string(),
            campaigns_written: self.campaigns_written,
            metrics_written: self.metrics_written,
            error_count: self.errors.len() as u64,
            first_error: self.errors.first().cloned(),
            started_at: staleness::timestamp(self.started_at),
            completed_at: staleness::timestamp(self.completed_at),
            duration_ms: self.duration_ms(),
        }
    }
}

/// Callbacks for reporting fleet-sync progress (e.g. to a terminal).
pub trait SyncProgress: Send + Sync {
    fn on_account_start(&self, _account_id: &str, _index: usize, _total: usize) {}
    fn on_campaigns_fetched(&self, _account_id: &str, _count: usize) {}
    fn on_metrics_fetched(&self, _account_id: &str, _batch: &DateRange, _count: usize) {}
    fn on_account_complete(&self, _outcome: &SyncOutcome) {}
}

pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// One async mutex per account id; serializes same-account syncs so a
/// manual refresh racing a scheduled one does not spend quota twice.
#[derive(Clone, Default)]
pub struct AccountLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AccountLocks {
    pub fn for_account(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(account_id.to_string()).or_default().clone()
    }
}

/// Background writer for activity-log rows. Writes never block or fail
/// the sync that produced them; failures are logged at warn.
#[derive(Clone, Default)]
pub struct ActivityLog {
    pending: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl ActivityLog {
    pub(crate) fn record(&self, db: &Database, outcome: &SyncOutcome) {
        let entry = outcome.log_entry();
        let db = db.clone();
        let handle = tokio::spawn(async move {
            let result = db
                .writer()
                .call(move |conn| repository::insert_sync_log(conn, &entry))
                .await;
            if let Err(e) = result {
                log::warn!("Failed to write activity log entry: {e}");
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait until every entry recorded so far has been written.
    pub async fn flush(&self) {
        let handles = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Activity log writer panicked: {e}");
            }
        }
    }
}
