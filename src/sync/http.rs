//! JSON-over-HTTP implementation of [`ReportingClient`].
//!
//! Endpoints, relative to the connection's base URL:
//!
//! - `GET v1/customers/{customer_id}/campaigns` → `{"campaigns": [...], "next_page_token": ...}`
//! - `GET v1/customers/{customer_id}/metrics?campaign_ids=a,b&start_date=..&end_date=..`
//!   → `{"rows": [...], "next_page_token": ...}`
//!
//! Pages are followed until `next_page_token` is absent. A 429 surfaces as
//! [`Error::RateLimited`] and is not retried. Records are decoded one at a
//! time; a malformed record is rejected without failing its page.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::date_util::date_key;
use crate::error::{Error, Result};
use crate::sync::client::{
    ClientFactory, ConnectionParams, Listing, RemoteCampaign, RemoteDailyMetric, ReportingClient,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const LOGIN_CUSTOMER_HEADER: &str = "login-customer-id";
/// Longest error body kept in [`Error::RemoteStatus`].
const MAX_ERROR_BODY: usize = 500;

#[derive(Deserialize)]
struct CampaignPage {
    #[serde(default)]
    campaigns: Vec<Value>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MetricPage {
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct HttpReportingClient {
    client: Client,
}

impl HttpReportingClient {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("adcache/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn endpoint(params: &ConnectionParams, tail: &str) -> Result<Url> {
        let mut url = Url::parse(&params.base_url).map_err(|e| {
            Error::Config(format!("invalid base URL '{}': {e}", params.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("base URL '{}' cannot have a path", params.base_url)))?
            .pop_if_empty()
            .extend(["v1", "customers", params.customer_id.as_str(), tail]);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        params: &ConnectionParams,
        url: Url,
        context: &str,
    ) -> Result<T> {
        log::trace!("GET {url}");
        let mut request = self.client.get(url.clone()).bearer_auth(&params.access_token);
        if let Some(login) = &params.login_customer_id {
            request = request.header(LOGIN_CUSTOMER_HEADER, login);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            log::warn!("Rate limited on {context} for {}", params.customer_id);
            return Err(Error::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| message.is_char_boundary(*i))
                    .unwrap_or(0);
                message.truncate(cut);
            }
            return Err(Error::RemoteStatus {
                status: status.as_u16(),
                url: url.to_string(),
                message,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| Error::Decode {
            context: context.to_string(),
            source,
        })
    }
}

#[async_trait]
impl ReportingClient for HttpReportingClient {
    async fn list_campaigns(&self, params: &ConnectionParams) -> Result<Listing<RemoteCampaign>> {
        let base = Self::endpoint(params, "campaigns")?;
        let mut campaigns = Listing::default();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = base.clone();
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("page_token", token);
            }
            let page: CampaignPage = self.get_json(params, url, "campaigns").await?;
            decode_records(page.campaigns, &mut campaigns, describe_campaign);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(campaigns)
    }

    async fn list_daily_metrics(
        &self,
        params: &ConnectionParams,
        campaign_ids: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Listing<RemoteDailyMetric>> {
        if campaign_ids.is_empty() {
            return Ok(Listing::default());
        }

        let mut base = Self::endpoint(params, "metrics")?;
        base.query_pairs_mut()
            .append_pair("campaign_ids", &campaign_ids.join(","))
            .append_pair("start_date", &date_key(start))
            .append_pair("end_date", &date_key(end));

        let mut rows = Listing::default();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = base.clone();
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("page_token", token);
            }
            let page: MetricPage = self.get_json(params, url, "metrics").await?;
            decode_records(page.rows, &mut rows, describe_metric);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(rows)
    }
}

fn decode_records<T: DeserializeOwned>(
    values: Vec<Value>,
    listing: &mut Listing<T>,
    describe: fn(&Value) -> String,
) {
    for value in values {
        match T::deserialize(&value) {
            Ok(record) => listing.records.push(record),
            Err(e) => {
                let message = format!("{}: malformed record: {e}", describe(&value));
                log::warn!("Rejecting {message}");
                listing.rejected.push(message);
            }
        }
    }
}

/// Best-effort identity of a raw record, `?` for absent fields.
fn field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "?".to_string(),
        Some(other) => other.to_string(),
    }
}

fn describe_campaign(value: &Value) -> String {
    format!("campaign {}", field(value, "id"))
}

fn describe_metric(value: &Value) -> String {
    format!("metric {}/{}", field(value, "campaign_id"), field(value, "date"))
}

/// Builds [`HttpReportingClient`]s sharing one connection pool.
pub struct HttpClientFactory {
    client: Arc<HttpReportingClient>,
}

impl HttpClientFactory {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: Arc::new(HttpReportingClient::new(timeout_secs)?),
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, params: &ConnectionParams) -> Result<Arc<dyn ReportingClient>> {
        // Reject unusable connections before any request is made
        HttpReportingClient::endpoint(params, "campaigns")?;
        let client: Arc<dyn ReportingClient> = self.client.clone();
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params_for(server: &MockServer) -> ConnectionParams {
        ConnectionParams {
            base_url: server.uri(),
            customer_id: "123-456".to_string(),
            access_token: "tok".to_string(),
            login_customer_id: None,
        }
    }

    fn client() -> HttpReportingClient {
        HttpReportingClient::new(5).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn test_list_campaigns_follows_pages() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/customers/123-456/campaigns"))
            .and(query_param("page_token", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "campaigns": [{"id": "c2", "name": "Second", "status": "PAUSED"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/customers/123-456/campaigns"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "campaigns": [{"id": "c1", "name": "First", "status": "ENABLED", "budget_micros": 5000000}],
                "next_page_token": "p2"
            })))
            .mount(&server)
            .await;

        let campaigns = client().list_campaigns(&params_for(&server)).await.unwrap().records;
        let ids: Vec<&str> = campaigns.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(campaigns[0].budget_micros, Some(5_000_000));
    }

    #[tokio::test]
    async fn test_list_daily_metrics_sends_window_and_login_header() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/customers/123-456/metrics"))
            .and(query_param("campaign_ids", "c1,c2"))
            .and(query_param("start_date", "2025-01-01"))
            .and(query_param("end_date", "2025-01-31"))
            .and(header("login-customer-id", "999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rows": [{
                    "campaign_id": "c1", "date": "2025-01-02",
                    "impressions": 100, "clicks": 4, "conversions": 1.5, "cost_micros": 2500000
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let params = ConnectionParams {
            login_customer_id: Some("999".to_string()),
            ..params_for(&server)
        };
        let rows = client()
            .list_daily_metrics(&params, &["c1".into(), "c2".into()], d(2025, 1, 1), d(2025, 1, 31))
            .await
            .unwrap();
        assert_eq!(rows.records.len(), 1);
        assert!(rows.rejected.is_empty());
        assert_eq!(rows.records[0].cost_micros, 2_500_000);
    }

    #[tokio::test]
    async fn test_no_campaigns_means_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let rows = client()
            .list_daily_metrics(&params_for(&server), &[], d(2025, 1, 1), d(2025, 1, 2))
            .await
            .unwrap();
        assert!(rows.records.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_rows_are_rejected_individually() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/123-456/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rows": [
                    {"campaign_id": "c1", "date": "2025-01-01", "impressions": 10},
                    {"campaign_id": "c1", "impressions": 20},
                    {"campaign_id": "c1", "date": "2025-01-03", "clicks": "many"},
                    {"campaign_id": "c1", "date": "2025-01-04", "impressions": 40}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/123-456/campaigns"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "campaigns": [{"id": "c1", "name": "First", "status": "ENABLED"}, {"name": "No id"}]
            })))
            .mount(&server)
            .await;

        let params = params_for(&server);
        let rows = client()
            .list_daily_metrics(&params, &["c1".into()], d(2025, 1, 1), d(2025, 1, 4))
            .await
            .unwrap();
        let dates: Vec<&str> = rows.records.iter().map(|r| r.date.as_str()).collect();
        assert_eq!(dates, vec!["2025-01-01", "2025-01-04"]);
        assert_eq!(rows.rejected.len(), 2);
        assert!(rows.rejected[0].starts_with("metric c1/?"), "{:?}", rows.rejected);
        assert!(rows.rejected[0].contains("date"), "{:?}", rows.rejected);
        assert!(rows.rejected[1].starts_with("metric c1/2025-01-03"), "{:?}", rows.rejected);

        let campaigns = client().list_campaigns(&params).await.unwrap();
        assert_eq!(campaigns.records.len(), 1);
        assert_eq!(campaigns.rejected.len(), 1);
        assert!(campaigns.rejected[0].starts_with("campaign ?"));
    }

    #[tokio::test]
    async fn test_rate_limit_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "42"))
            .mount(&server)
            .await;

        match client().list_campaigns(&params_for(&server)).await {
            Err(Error::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, Some(42)),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_status_and_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/123-456/campaigns"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/123-456/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let params = params_for(&server);
        match client().list_campaigns(&params).await {
            Err(Error::RemoteStatus { status, message, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "permission denied");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        match client()
            .list_daily_metrics(&params, &["c1".into()], d(2025, 1, 1), d(2025, 1, 1))
            .await
        {
            Err(Error::Decode { context, .. }) => assert_eq!(context, "metrics"),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_factory_rejects_bad_base_url() {
        let factory = HttpClientFactory::new().unwrap();
        let params = ConnectionParams {
            base_url: "not a url".to_string(),
            customer_id: "1".to_string(),
            access_token: "t".to_string(),
            login_customer_id: None,
        };
        assert!(matches!(factory.build(&params), Err(Error::Config(_))));
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let params = ConnectionParams {
            base_url: "https://ads.example.com/api/".to_string(),
            customer_id: "42".to_string(),
            access_token: "t".to_string(),
            login_customer_id: None,
        };
        let url = HttpReportingClient::endpoint(&params, "campaigns").unwrap();
        assert_eq!(url.as_str(), "https://ads.example.com/api/v1/customers/42/campaigns");
    }
}
