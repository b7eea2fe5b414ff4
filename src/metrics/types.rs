use chrono::NaiveDate;
use serde::Serialize;

use crate::date_util::{round2, safe_ratio};
use crate::models::CampaignStatus;
use crate::range::DateRange;

/// Summed counters plus rates derived from those sums.
///
/// Rates are never averaged: they are recomputed from the summed counters
/// in [`MetricTotals::finalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricTotals {
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: f64,
    pub cost: f64,
    /// Percent.
    pub ctr: f64,
    /// Percent.
    pub conversion_rate: f64,
    pub average_cpc: f64,
    pub cost_per_conversion: f64,
}

impl MetricTotals {
    pub fn add_sample(&mut self, sample: &MetricSample) {
        self.impressions += sample.impressions;
        self.clicks += sample.clicks;
        self.conversions += sample.conversions;
        self.cost += sample.cost;
    }

    pub fn add_counters(&mut self, other: &MetricTotals) {
        self.impressions += other.impressions;
        self.clicks += other.clicks;
        self.conversions += other.conversions;
        self.cost += other.cost;
    }

    pub fn has_activity(&self) -> bool {
        self.impressions > 0 || self.clicks > 0 || self.conversions > 0.0 || self.cost > 0.0
    }

    pub fn finalize(self) -> Self {
        let impressions = self.impressions as f64;
        let clicks = self.clicks as f64;
        Self {
            conversions: round2(self.conversions),
            cost: round2(self.cost),
            ctr: round2(safe_ratio(clicks, impressions) * 100.0),
            conversion_rate: round2(safe_ratio(self.conversions, clicks) * 100.0),
            average_cpc: round2(safe_ratio(self.cost, clicks)),
            cost_per_conversion: round2(safe_ratio(self.cost, self.conversions)),
            ..self
        }
    }
}

/// One (campaign, day) row of counters in currency units, from either the
/// cache or a live fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub campaign_remote_id: String,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: f64,
    pub cost: f64,
}

/// Campaign identity as needed for the breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignInfo {
    pub remote_id: String,
    pub name: String,
    pub status: CampaignStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignBreakdown {
    pub campaign_id: String,
    pub name: String,
    pub status: CampaignStatus,
    #[serde(flatten)]
    pub totals: MetricTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub totals: MetricTotals,
}

/// Where an aggregated view's numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Cache,
    LiveFallback,
}

/// Dashboard-ready summary of one account over one date range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedView {
    pub account_id: String,
    pub range: DateRange,
    pub totals: MetricTotals,
    pub campaigns: Vec<CampaignBreakdown>,
    /// Exactly one point per calendar day in `range`.
    pub daily: Vec<DailyPoint>,
    pub provenance: Provenance,
    /// Milliseconds since the last successful campaign sync; `None` for live data.
    pub cache_age_ms: Option<i64>,
}
