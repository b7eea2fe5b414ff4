pub mod types;

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

pub use types::*;

use crate::date_util::{micros_to_currency, parse_date_key};
use crate::error::Result;
use crate::models::CampaignStatus;
use crate::range::DateRange;
use crate::storage::{repository, Database};
use crate::sync::client::{ConnectionParams, RemoteDailyMetric, ReportingClient};
use crate::sync::staleness::parse_timestamp;

/// Build an aggregated view from campaign identities and daily samples.
///
/// Samples outside `range` are ignored. Removed campaigns only appear in
/// the breakdown when they have activity in range. Samples for campaigns
/// not in `campaigns` are kept under their remote id.
pub fn aggregate(
    account_id: &str,
    range: DateRange,
    campaigns: &[CampaignInfo],
    samples: &[MetricSample],
    provenance: Provenance,
    cache_age_ms: Option<i64>,
) -> AggregatedView {
    let mut by_campaign: HashMap<&str, MetricTotals> = HashMap::new();
    let mut by_day: BTreeMap<_, MetricTotals> =
        range.days().map(|d| (d, MetricTotals::default())).collect();

    for sample in samples.iter().filter(|s| range.contains(s.date)) {
        by_campaign
            .entry(sample.campaign_remote_id.as_str())
            .or_default()
            .add_sample(sample);
        if let Some(day) = by_day.get_mut(&sample.date) {
            day.add_sample(sample);
        }
    }

    let mut totals = MetricTotals::default();
    let mut breakdown = Vec::with_capacity(campaigns.len());
    let mut known = HashSet::new();

    for campaign in campaigns {
        known.insert(campaign.remote_id.as_str());
        let sums = by_campaign
            .get(campaign.remote_id.as_str())
            .copied()
            .unwrap_or_default();
        totals.add_counters(&sums);
        if campaign.status == CampaignStatus::Removed && !sums.has_activity() {
            continue;
        }
        breakdown.push(CampaignBreakdown {
            campaign_id: campaign.remote_id.clone(),
            name: campaign.name.clone(),
            status: campaign.status,
            totals: sums.finalize(),
        });
    }

    for (remote_id, sums) in by_campaign.iter().filter(|(id, _)| !known.contains(*id)) {
        totals.add_counters(sums);
        breakdown.push(CampaignBreakdown {
            campaign_id: remote_id.to_string(),
            name: remote_id.to_string(),
            status: CampaignStatus::Unknown,
            totals: sums.finalize(),
        });
    }

    breakdown.sort_by(|a, b| {
        b.totals
            .cost
            .total_cmp(&a.totals.cost)
            .then_with(|| a.campaign_id.cmp(&b.campaign_id))
    });

    AggregatedView {
        account_id: account_id.to_string(),
        range,
        totals: totals.finalize(),
        campaigns: breakdown,
        daily: by_day
            .into_iter()
            .map(|(date, sums)| DailyPoint {
                date,
                totals: sums.finalize(),
            })
            .collect(),
        provenance,
        cache_age_ms,
    }
}

/// Aggregate from the local store. `None` when the account has no cached
/// campaigns at all.
pub async fn cached_view(
    db: &Database,
    account_id: &str,
    range: DateRange,
    now: DateTime<Utc>,
) -> Result<Option<AggregatedView>> {
    let (campaigns, metrics) = db
        .reader()
        .call({
            let account_id = account_id.to_string();
            move |conn| {
                let campaigns = repository::list_campaigns(conn, &account_id)?;
                let metrics =
                    repository::list_daily_metrics(conn, &account_id, range.start, range.end)?;
                Ok::<_, rusqlite::Error>((campaigns, metrics))
            }
        })
        .await?;

    if campaigns.is_empty() {
        return Ok(None);
    }

    let cache_age_ms = campaigns
        .iter()
        .filter_map(|c| parse_timestamp(&c.last_synced_at))
        .max()
        .map(|last| (now - last).num_milliseconds().max(0));

    let infos: Vec<CampaignInfo> = campaigns
        .into_iter()
        .map(|c| CampaignInfo {
            remote_id: c.remote_id,
            name: c.name,
            status: c.status,
        })
        .collect();

    let samples: Vec<MetricSample> = metrics
        .into_iter()
        .filter_map(|m| match parse_date_key(&m.date) {
            Some(date) => Some(MetricSample {
                campaign_remote_id: m.campaign_remote_id,
                date,
                impressions: m.impressions,
                clicks: m.clicks,
                conversions: m.conversions,
                cost: m.cost,
            }),
            None => {
                log::warn!("Ignoring stored metric with bad date '{}'", m.date);
                None
            }
        })
        .collect();

    Ok(Some(aggregate(
        account_id,
        range,
        &infos,
        &samples,
        Provenance::Cache,
        cache_age_ms,
    )))
}

/// Aggregate straight from the reporting API. Nothing is written locally.
/// Fetch failures are returned to the caller.
pub async fn live_view(
    client: &dyn ReportingClient,
    params: &ConnectionParams,
    account_id: &str,
    range: DateRange,
) -> Result<AggregatedView> {
    let campaigns = client.list_campaigns(params).await?;
    let ids: Vec<String> = campaigns.records.iter().map(|c| c.id.clone()).collect();
    let rows = client
        .list_daily_metrics(params, &ids, range.start, range.end)
        .await?;
    for message in campaigns.rejected.iter().chain(&rows.rejected) {
        log::warn!("Ignoring live record: {message}");
    }
    let (campaigns, rows) = (campaigns.records, rows.records);
    log::info!(
        "Live fallback for {account_id}: {} campaigns, {} rows",
        campaigns.len(),
        rows.len()
    );

    let infos: Vec<CampaignInfo> = campaigns
        .into_iter()
        .map(|c| CampaignInfo {
            status: CampaignStatus::from_remote(&c.status),
            remote_id: c.id,
            name: c.name,
        })
        .collect();
    let samples: Vec<MetricSample> = rows
        .iter()
        .filter_map(|row| match sample_from_remote(row) {
            Ok(sample) => Some(sample),
            Err(message) => {
                log::warn!("Ignoring live metric row: {message}");
                None
            }
        })
        .collect();

    Ok(aggregate(
        account_id,
        range,
        &infos,
        &samples,
        Provenance::LiveFallback,
        None,
    ))
}

fn sample_from_remote(row: &RemoteDailyMetric) -> std::result::Result<MetricSample, String> {
    let date = parse_date_key(&row.date)
        .ok_or_else(|| format!("{}: invalid date '{}'", row.campaign_id, row.date))?;
    let count = |name: &str, v: i64| {
        u64::try_from(v).map_err(|_| format!("{}/{}: negative {name}", row.campaign_id, row.date))
    };
    if row.cost_micros < 0 || !row.conversions.is_finite() || row.conversions < 0.0 {
        return Err(format!("{}/{}: invalid cost or conversions", row.campaign_id, row.date));
    }
    Ok(MetricSample {
        campaign_remote_id: row.campaign_id.clone(),
        date,
        impressions: count("impressions", row.impressions)?,
        clicks: count("clicks", row.clicks)?,
        conversions: row.conversions,
        cost: micros_to_currency(row.cost_micros),
    })
}
