//! Rate-limited client for the remote project API.
//!
//! Two endpoints matter: the per-country project listing and the per-project
//! relationships lookup. Both are POSTs with a bearer token. Every call goes
//! through the pacing gate and is retried with exponential backoff when the
//! failure is transient.

mod geocoder;
mod parser;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use mineassembler_shared::{ApiConfig, ApiError, AssemblyError, ProjectId, RawSourceRecord, Result};

pub use geocoder::{Address, NominatimGeocoder, ReverseGeocoder};
pub use parser::{parse_listing, parse_relationships};
pub use retry::{PacingGate, RetryPolicy};

/// User-Agent string for API and geocoding requests.
pub(crate) const USER_AGENT: &str = concat!("mineassembler/", env!("CARGO_PKG_VERSION"));

const LISTING_ENDPOINT: &str = "/projects/filter";
const RELATIONSHIPS_ENDPOINT: &str = "/project/relationships";

// ---------------------------------------------------------------------------
// ProjectApi
// ---------------------------------------------------------------------------

/// The structured data source the resolver consults first.
#[async_trait]
pub trait ProjectApi: Send + Sync {
    /// Every project the API lists for one country, tagged `listing`.
    async fn fetch_listing(&self, country: &str) -> std::result::Result<Vec<RawSourceRecord>, ApiError>;

    /// Company relationships of one project, tagged `relationships`.
    async fn fetch_relationships(
        &self,
        id: &ProjectId,
    ) -> std::result::Result<RawSourceRecord, ApiError>;
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// HTTP implementation of [`ProjectApi`].
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
    retry: RetryPolicy,
    pacing: PacingGate,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AssemblyError::Network(format!("failed to build HTTP client: {e}")))?;

        info!(base_url = %config.base_url, attempts = config.retry_attempts, "API client ready");

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            retry: RetryPolicy::from(config),
            pacing: PacingGate::from(config),
        })
    }

    /// Requests issued so far, retries included.
    pub fn calls(&self) -> u64 {
        self.pacing.calls()
    }

    /// POST `body` to `endpoint` with pacing and retries.
    async fn post(&self, endpoint: &str, body: &Value) -> std::result::Result<Value, ApiError> {
        let url = format!("{}{endpoint}", self.base_url);
        let url = url.as_str();
        retry::with_backoff(&self.retry, endpoint, move || async move {
            self.pacing.before_call().await;
            let result = self.send_once(url, endpoint, body).await;
            self.pacing.after_call().await;
            result
        })
        .await
    }

    async fn send_once(
        &self,
        url: &str,
        endpoint: &str,
        body: &Value,
    ) -> std::result::Result<Value, ApiError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        if let Some(err) = classify_status(status, endpoint) {
            debug!(%status, endpoint, "request failed");
            return Err(err);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::Transient(format!("{url}: invalid JSON: {e}")))
    }
}

/// Map a non-success status onto the error taxonomy. `None` for 2xx.
fn classify_status(status: StatusCode, endpoint: &str) -> Option<ApiError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("{endpoint}: HTTP {status}");
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::Unauthorized(endpoint.to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT => ApiError::Transient(detail),
        s if s.is_server_error() => ApiError::Transient(detail),
        _ => ApiError::NotFound(detail),
    })
}

#[async_trait]
impl ProjectApi for ApiClient {
    #[instrument(skip_all, fields(country = %country))]
    async fn fetch_listing(&self, country: &str) -> std::result::Result<Vec<RawSourceRecord>, ApiError> {
        let body = json!({
            "filters": {
                "country": country,
                "marketcap": {"min": 0, "max": 10000},
                "outstandingshares": {"min": 0, "max": 10000},
                "projectSize": [null, null],
                "commoditiesWhere": "any",
            },
            "token": self.token,
        });
        let payload = self.post(LISTING_ENDPOINT, &body).await?;
        let records = parser::parse_listing(country, payload)?;
        info!(projects = records.len(), "listing fetched");
        Ok(records)
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn fetch_relationships(
        &self,
        id: &ProjectId,
    ) -> std::result::Result<RawSourceRecord, ApiError> {
        let body = json!({ "gid": id.as_str() });
        let payload = self.post(RELATIONSHIPS_ENDPOINT, &body).await?;
        let record = parser::parse_relationships(id, payload)?;
        debug!(companies = record.fields.companies.len(), "relationships fetched");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, attempts: u32) -> ApiClient {
        let config = ApiConfig {
            base_url: server.uri(),
            retry_attempts: attempts,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            pacing_every: 0,
            pacing_pause_ms: 0,
            ..ApiConfig::default()
        };
        ApiClient::new(&config, "jwt-test").unwrap()
    }

    #[test]
    fn status_classification() {
        let ep = "/project/relationships";
        assert_eq!(classify_status(StatusCode::OK, ep), None);
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, ep),
            Some(ApiError::Unauthorized(ep.into()))
        );
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ep),
            Some(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ep),
            Some(ApiError::RateLimited(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ep),
            Some(ApiError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ep),
            Some(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn relationships_success_sends_bearer_and_gid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RELATIONSHIPS_ENDPOINT))
            .and(header("authorization", "Bearer jwt-test"))
            .and(body_partial_json(json!({"gid": "1001"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jv": [[{"id": 55, "company_name": "Acme Mining", "percentage": 60}]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 3);
        let record = client
            .fetch_relationships(&ProjectId::new("1001"))
            .await
            .unwrap();
        assert_eq!(record.fields.companies.len(), 1);
        assert_eq!(record.fields.companies[0].company_name, "Acme Mining");
    }

    #[tokio::test]
    async fn transient_errors_exhaust_exact_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RELATIONSHIPS_ENDPOINT))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let client = client_for(&server, 4);
        let err = client
            .fetch_relationships(&ProjectId::new("1001"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transient(_)));
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn rate_limit_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RELATIONSHIPS_ENDPOINT))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RELATIONSHIPS_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jv": []})))
            .mount(&server)
            .await;

        let client = client_for(&server, 4);
        let record = client
            .fetch_relationships(&ProjectId::new("1002"))
            .await
            .unwrap();
        assert!(record.fields.companies.is_empty());
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 4);
        let err = client.fetch_listing("Canada").await.unwrap_err();
        assert_eq!(err, ApiError::Unauthorized(LISTING_ENDPOINT.into()));
    }

    #[tokio::test]
    async fn null_relationships_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RELATIONSHIPS_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 4);
        let err = client
            .fetch_relationships(&ProjectId::new("1003"))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::NotFound("1003".into()));
    }

    #[tokio::test]
    async fn listing_sends_country_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LISTING_ENDPOINT))
            .and(body_partial_json(json!({
                "filters": {"country": "Australia", "commoditiesWhere": "any"},
                "token": "jwt-test"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"gid": 1001, "project_name": "Acme Ridge", "stage": "Mining", "location": "NT, Australia"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let records = client.fetch_listing("Australia").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields.stage.as_deref(), Some("Mining"));
    }
}
