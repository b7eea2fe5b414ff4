//! Traits at the boundary between the sync engine and the outside world:
//! the reporting API and the credential store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::AccountStatus;
use crate::storage::{repository, Database};

/// Connection parameters for one external ad account.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Base URL of the reporting API, e.g. `https://ads.example.com/api`.
    pub base_url: String,
    /// The remote account (customer) id the reports are scoped to.
    pub customer_id: String,
    pub access_token: String,
    /// Manager account id when accessing through a manager hierarchy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_customer_id: Option<String>,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("base_url", &self.base_url)
            .field("customer_id", &self.customer_id)
            .field("access_token", &"<redacted>")
            .field("login_customer_id", &self.login_customer_id)
            .finish()
    }
}

/// A campaign as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCampaign {
    pub id: String,
    pub name: String,
    /// Raw status string, normalized by the reconciler.
    pub status: String,
    /// Declared budget in micros.
    #[serde(default)]
    pub budget_micros: Option<i64>,
    /// `YYYY-MM-DD`, unvalidated.
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

/// One (campaign, day) row of raw counters as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDailyMetric {
    pub campaign_id: String,
    /// `YYYY-MM-DD`, unvalidated.
    pub date: String,
    #[serde(default)]
    pub impressions: i64,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub conversions: f64,
    #[serde(default)]
    pub cost_micros: i64,
}

/// Records returned by one listing call. Upstream records that could not
/// be decoded are left out of `records` and described in `rejected`.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub records: Vec<T>,
    pub rejected: Vec<String>,
}

impl<T> Listing<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self {
            records,
            rejected: Vec::new(),
        }
    }
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Read access to the external reporting API.
///
/// Transport, status and page-level decode errors fail the whole call;
/// nothing here retries. A single malformed record only lands in
/// [`Listing::rejected`].
#[async_trait]
pub trait ReportingClient: Send + Sync {
    /// All campaigns currently visible to the account.
    async fn list_campaigns(&self, params: &ConnectionParams) -> Result<Listing<RemoteCampaign>>;

    /// Daily rows for the given campaigns over [start, end].
    async fn list_daily_metrics(
        &self,
        params: &ConnectionParams,
        campaign_ids: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Listing<RemoteDailyMetric>>;
}

/// Builds a reporting client for a resolved connection.
pub trait ClientFactory: Send + Sync {
    fn build(&self, params: &ConnectionParams) -> Result<Arc<dyn ReportingClient>>;
}

/// Turns an account configuration id into connection parameters.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Fails with [`Error::Connection`] when the account is missing or inactive.
    async fn resolve(&self, account_id: &str) -> Result<ConnectionParams>;
}

/// Resolves credentials from the `account_configs` table.
pub struct StoredCredentialResolver {
    db: Database,
}

impl StoredCredentialResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialResolver for StoredCredentialResolver {
    async fn resolve(&self, account_id: &str) -> Result<ConnectionParams> {
        let config = self
            .db
            .reader()
            .call({
                let account_id = account_id.to_string();
                move |conn| repository::get_account_config(conn, &account_id)
            })
            .await?
            .ok_or_else(|| Error::connection(account_id, "no account configuration"))?;

        if config.status == AccountStatus::Inactive {
            return Err(Error::connection(account_id, "account is inactive"));
        }

        serde_json::from_str(&config.connection_json).map_err(|e| {
            Error::connection(account_id, format!("invalid connection parameters: {e}"))
        })
    }
}
