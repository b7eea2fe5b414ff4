use serde::{Deserialize, Serialize};

use crate::date_util::{round2, safe_ratio};

/// Delivery status of a campaign, normalized from the remote API's strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Enabled,
    Paused,
    Removed,
    Unknown,
}

impl CampaignStatus {
    pub fn from_remote(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "active" | "serving" => CampaignStatus::Enabled,
            "paused" => CampaignStatus::Paused,
            "removed" | "deleted" | "archived" => CampaignStatus::Removed,
            _ => CampaignStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Enabled => "enabled",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Removed => "removed",
            CampaignStatus::Unknown => "unknown",
        }
    }
}

/// Lifecycle of an account configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Error,
}

impl AccountStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(AccountStatus::Active),
            "inactive" => Some(AccountStatus::Inactive),
            "error" => Some(AccountStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Error => "error",
        }
    }
}

/// Rate fields stored next to a daily metric row.
///
/// Computed once at write time from the raw counters; readers trust the
/// stored values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DerivedRates {
    /// Click-through rate, percent.
    pub ctr: f64,
    /// Average cost per click, currency units.
    pub average_cpc: f64,
    /// Conversions per click, percent.
    pub conversion_rate: f64,
}

impl DerivedRates {
    pub fn compute(impressions: u64, clicks: u64, conversions: f64, cost: f64) -> Self {
        Self {
            ctr: round2(safe_ratio(clicks as f64, impressions as f64) * 100.0),
            average_cpc: round2(safe_ratio(cost, clicks as f64)),
            conversion_rate: round2(safe_ratio(conversions, clicks as f64) * 100.0),
        }
    }
}
