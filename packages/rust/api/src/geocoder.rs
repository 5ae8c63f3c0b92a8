//! Reverse geocoding against a Nominatim-compatible endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use mineassembler_shared::{AssemblyError, Coordinates, GeocodeError, GeocodingConfig, Result};

use crate::USER_AGENT;

/// Administrative fields resolved for a coordinate pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub country: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub county: Option<String>,
}

/// Anything that turns coordinates into administrative fields.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse(&self, coords: Coordinates) -> std::result::Result<Address, GeocodeError>;
}

// ---------------------------------------------------------------------------
// Nominatim
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<NominatimAddress>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NominatimAddress {
    country: Option<String>,
    state: Option<String>,
    state_district: Option<String>,
    region: Option<String>,
    province: Option<String>,
    territory: Option<String>,
    postcode: Option<String>,
    county: Option<String>,
}

impl From<NominatimAddress> for Address {
    fn from(a: NominatimAddress) -> Self {
        // Not every country reports a "state"; take the nearest equivalent.
        let state = a
            .state
            .or(a.state_district)
            .or(a.region)
            .or(a.province)
            .or(a.territory);
        Address {
            country: a.country,
            state,
            postcode: a.postcode,
            county: a.county,
        }
    }
}

/// Nominatim client with a minimum interval between requests.
pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodingConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AssemblyError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            min_interval: Duration::from_millis(config.min_interval_ms),
            last_call: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    #[instrument(skip_all, fields(lat = coords.latitude, lon = coords.longitude))]
    async fn reverse(&self, coords: Coordinates) -> std::result::Result<Address, GeocodeError> {
        // Held for the whole request: one call in flight at a time.
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let since = previous.elapsed();
            if since < self.min_interval {
                tokio::time::sleep(self.min_interval - since).await;
            }
        }
        *last_call = Some(Instant::now());

        let url = format!("{}/reverse", self.endpoint);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en")
            .query(&[
                ("lat", coords.latitude.to_string()),
                ("lon", coords.longitude.to_string()),
                ("format", "json".to_string()),
                ("addressdetails", "1".to_string()),
                ("zoom", "10".to_string()),
            ])
            .send()
            .await
            .map_err(|e| GeocodeError::Unavailable(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Unavailable(format!("{url}: HTTP {status}")));
        }

        let body: ReverseResponse = response
            .json()
            .await
            .map_err(|e| GeocodeError::Unavailable(format!("{url}: invalid JSON: {e}")))?;

        if let Some(error) = body.error {
            return Err(GeocodeError::Unavailable(error));
        }
        let address = body
            .address
            .map(Address::from)
            .ok_or_else(|| GeocodeError::Unavailable("response has no address".into()))?;

        debug!(state = ?address.state, country = ?address.country, "reverse geocoded");
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: &str) -> GeocodingConfig {
        GeocodingConfig {
            endpoint: endpoint.to_string(),
            min_interval_ms: 0,
            ..GeocodingConfig::default()
        }
    }

    const COORDS: Coordinates = Coordinates {
        latitude: -19.25,
        longitude: 131.5,
    };

    #[tokio::test]
    async fn resolves_state_and_country() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .and(query_param("format", "json"))
            .and(query_param("zoom", "10"))
            .and(header("accept-language", "en"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "address": {
                    "state": "Northern Territory",
                    "country": "Australia",
                    "postcode": "0872"
                }
            })))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(&config(&server.uri())).unwrap();
        let address = geocoder.reverse(COORDS).await.unwrap();
        assert_eq!(address.state.as_deref(), Some("Northern Territory"));
        assert_eq!(address.country.as_deref(), Some("Australia"));
        assert_eq!(address.postcode.as_deref(), Some("0872"));
    }

    #[tokio::test]
    async fn falls_back_to_province() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "address": {"province": "Ontario", "country": "Canada"}
            })))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(&config(&server.uri())).unwrap();
        let address = geocoder.reverse(COORDS).await.unwrap();
        assert_eq!(address.state.as_deref(), Some("Ontario"));
    }

    #[tokio::test]
    async fn error_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"error": "Unable to geocode"})),
            )
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(&config(&server.uri())).unwrap();
        let err = geocoder.reverse(COORDS).await.unwrap_err();
        assert_eq!(err, GeocodeError::Unavailable("Unable to geocode".into()));
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(&config(&server.uri())).unwrap();
        assert!(geocoder.reverse(COORDS).await.is_err());
    }
}
