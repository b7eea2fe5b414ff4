//! In-memory doubles for the reporting API and credential store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::date_util::parse_date_key;
use crate::error::{Error, Result};
use crate::sync::client::{
    ClientFactory, ConnectionParams, CredentialResolver, Listing, RemoteCampaign,
    RemoteDailyMetric, ReportingClient,
};

pub fn params() -> ConnectionParams {
    ConnectionParams {
        base_url: "https://ads.example.com".to_string(),
        customer_id: "123-456-7890".to_string(),
        access_token: "test-token".to_string(),
        login_customer_id: None,
    }
}

pub fn remote_campaign(id: &str, status: &str) -> RemoteCampaign {
    RemoteCampaign {
        id: id.to_string(),
        name: format!("Campaign {id}"),
        status: status.to_string(),
        budget_micros: Some(50_000_000),
        start_date: None,
        end_date: None,
    }
}

pub fn remote_metric(
    campaign_id: &str,
    date: &str,
    impressions: i64,
    clicks: i64,
    conversions: f64,
    cost_micros: i64,
) -> RemoteDailyMetric {
    RemoteDailyMetric {
        campaign_id: campaign_id.to_string(),
        date: date.to_string(),
        impressions,
        clicks,
        conversions,
        cost_micros,
    }
}

/// Scripted reporting API. Metric calls filter the scripted rows by the
/// requested campaigns and dates, like the real endpoint.
pub struct FakeClient {
    campaigns: Vec<RemoteCampaign>,
    metrics: Vec<RemoteDailyMetric>,
    fail_campaigns: bool,
    /// Metric calls beyond this many fail.
    metric_calls_before_failure: usize,
    pub campaign_calls: AtomicUsize,
    pub metric_calls: AtomicUsize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            campaigns: Vec::new(),
            metrics: Vec::new(),
            fail_campaigns: false,
            metric_calls_before_failure: usize::MAX,
            campaign_calls: AtomicUsize::new(0),
            metric_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_campaigns(mut self, campaigns: Vec<RemoteCampaign>) -> Self {
        self.campaigns = campaigns;
        self
    }

    pub fn with_metrics(mut self, metrics: Vec<RemoteDailyMetric>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn failing_campaigns(mut self) -> Self {
        self.fail_campaigns = true;
        self
    }

    pub fn failing_metrics(self) -> Self {
        self.failing_metrics_after(0)
    }

    pub fn failing_metrics_after(mut self, calls: usize) -> Self {
        self.metric_calls_before_failure = calls;
        self
    }
}

#[async_trait]
impl ReportingClient for FakeClient {
    async fn list_campaigns(&self, _params: &ConnectionParams) -> Result<Listing<RemoteCampaign>> {
        self.campaign_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_campaigns {
            return Err(Error::RemoteStatus {
                status: 503,
                url: "fake://campaigns".to_string(),
                message: "unavailable".to_string(),
            });
        }
        Ok(Listing::new(self.campaigns.clone()))
    }

    async fn list_daily_metrics(
        &self,
        _params: &ConnectionParams,
        campaign_ids: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Listing<RemoteDailyMetric>> {
        let call = self.metric_calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.metric_calls_before_failure {
            return Err(Error::RateLimited {
                retry_after_secs: Some(30),
            });
        }
        let rows = self
            .metrics
            .iter()
            .filter(|m| campaign_ids.contains(&m.campaign_id))
            .filter(|m| match parse_date_key(&m.date) {
                Some(d) => d >= start && d <= end,
                // Malformed dates pass through so the caller sees them
                None => true,
            })
            .cloned()
            .collect();
        Ok(Listing::new(rows))
    }
}

/// Resolves a fixed set of accounts.
#[derive(Default)]
pub struct StaticResolver {
    accounts: HashMap<String, ConnectionParams>,
}

impl StaticResolver {
    /// Each account gets its own customer id, equal to the account id.
    pub fn with_account(mut self, account_id: &str) -> Self {
        let params = ConnectionParams {
            customer_id: account_id.to_string(),
            ..params()
        };
        self.accounts.insert(account_id.to_string(), params);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticResolver {
    async fn resolve(&self, account_id: &str) -> Result<ConnectionParams> {
        self.accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| Error::connection(account_id, "unknown account"))
    }
}

/// Hands out fake clients by customer id, falling back to a shared one.
pub struct FakeFactory {
    shared: Arc<FakeClient>,
    by_customer: HashMap<String, Arc<FakeClient>>,
}

impl FakeFactory {
    pub fn new(shared: Arc<FakeClient>) -> Self {
        Self {
            shared,
            by_customer: HashMap::new(),
        }
    }

    pub fn with_client(mut self, customer_id: &str, client: Arc<FakeClient>) -> Self {
        self.by_customer.insert(customer_id.to_string(), client);
        self
    }
}

impl ClientFactory for FakeFactory {
    fn build(&self, params: &ConnectionParams) -> Result<Arc<dyn ReportingClient>> {
        let client: Arc<dyn ReportingClient> = self
            .by_customer
            .get(&params.customer_id)
            .unwrap_or(&self.shared)
            .clone();
        Ok(client)
    }
}
