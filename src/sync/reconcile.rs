//! Merge fetched remote records into the local store.
//!
//! Each record is validated and upserted on its own. A bad record is
//! reported and skipped; it never prevents the rest of the batch from
//! being written.

use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;

use crate::date_util::{micros_to_currency, parse_date_key};
use crate::models::{CampaignStatus, DerivedRates};
use crate::storage::repository::{self, CampaignUpsert, DailyMetricUpsert};
use crate::sync::client::{RemoteCampaign, RemoteDailyMetric};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileResult {
    pub written: u64,
    pub errors: Vec<String>,
}

impl ReconcileResult {
    fn record(&mut self, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.written += 1,
            Err(message) => {
                log::warn!("Skipping record: {message}");
                self.errors.push(message);
            }
        }
    }
}

/// Upsert every campaign for `account_id`, stamping `synced_at` as the
/// campaign's last-synced time.
pub fn reconcile_campaigns(
    conn: &mut Connection,
    account_id: &str,
    remote: &[RemoteCampaign],
    synced_at: &str,
) -> Result<ReconcileResult, rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut result = ReconcileResult::default();

    for campaign in remote {
        let outcome = campaign_upsert(account_id, campaign, synced_at).and_then(|row| {
            repository::upsert_campaign(&tx, &row)
                .map_err(|e| format!("campaign {}: {e}", campaign.id))
        });
        result.record(outcome);
    }

    tx.commit()?;
    Ok(result)
}

/// Upsert daily metric rows. Rows are matched to local campaigns through
/// the account's (remote id → local id) map; rows for campaigns that were
/// never synced are reported as errors.
pub fn reconcile_daily_metrics(
    conn: &mut Connection,
    account_id: &str,
    remote: &[RemoteDailyMetric],
    synced_at: &str,
) -> Result<ReconcileResult, rusqlite::Error> {
    let tx = conn.transaction()?;
    let campaign_ids = repository::campaign_ids_by_remote(&tx, account_id)?;
    let mut result = ReconcileResult::default();

    for metric in remote {
        let outcome = daily_metric_upsert(&campaign_ids, metric, synced_at).and_then(|row| {
            repository::upsert_daily_metric(&tx, &row).map_err(|e| {
                format!("metric {}/{}: {e}", metric.campaign_id, metric.date)
            })
        });
        result.record(outcome);
    }

    tx.commit()?;
    Ok(result)
}

fn campaign_upsert(
    account_id: &str,
    campaign: &RemoteCampaign,
    synced_at: &str,
) -> Result<CampaignUpsert, String> {
    if campaign.id.trim().is_empty() {
        return Err(format!("campaign '{}': missing id", campaign.name));
    }
    let start_date = optional_date(campaign.start_date.as_deref())
        .map_err(|raw| format!("campaign {}: invalid start_date '{raw}'", campaign.id))?;
    let end_date = optional_date(campaign.end_date.as_deref())
        .map_err(|raw| format!("campaign {}: invalid end_date '{raw}'", campaign.id))?;
    if let Some(micros) = campaign.budget_micros {
        if micros < 0 {
            return Err(format!("campaign {}: negative budget {micros}", campaign.id));
        }
    }

    Ok(CampaignUpsert {
        account_id: account_id.to_string(),
        remote_id: campaign.id.clone(),
        name: campaign.name.clone(),
        status: CampaignStatus::from_remote(&campaign.status),
        budget: campaign.budget_micros.map(micros_to_currency),
        start_date,
        end_date,
        synced_at: synced_at.to_string(),
    })
}

fn daily_metric_upsert(
    campaign_ids: &HashMap<String, i64>,
    metric: &RemoteDailyMetric,
    synced_at: &str,
) -> Result<DailyMetricUpsert, String> {
    let label = format!("metric {}/{}", metric.campaign_id, metric.date);

    let date = parse_date_key(&metric.date)
        .ok_or_else(|| format!("{label}: invalid date '{}'", metric.date))?;
    let campaign_id = *campaign_ids
        .get(&metric.campaign_id)
        .ok_or_else(|| format!("{label}: unknown campaign"))?;
    let impressions = non_negative(metric.impressions)
        .ok_or_else(|| format!("{label}: negative impressions {}", metric.impressions))?;
    let clicks = non_negative(metric.clicks)
        .ok_or_else(|| format!("{label}: negative clicks {}", metric.clicks))?;
    if !metric.conversions.is_finite() || metric.conversions < 0.0 {
        return Err(format!("{label}: invalid conversions {}", metric.conversions));
    }
    if metric.cost_micros < 0 {
        return Err(format!("{label}: negative cost {}", metric.cost_micros));
    }

    let cost = micros_to_currency(metric.cost_micros);
    Ok(DailyMetricUpsert {
        campaign_id,
        date,
        impressions,
        clicks,
        conversions: metric.conversions,
        cost,
        rates: DerivedRates::compute(impressions, clicks, metric.conversions, cost),
        synced_at: synced_at.to_string(),
    })
}

/// `Ok(None)` for absent/blank values, `Err(raw)` for unparseable ones.
fn optional_date(raw: Option<&str>) -> Result<Option<NaiveDate>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_date_key(s).map(Some).ok_or_else(|| s.to_string()),
    }
}

fn non_negative(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}
