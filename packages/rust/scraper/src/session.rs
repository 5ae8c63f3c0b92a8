//! Browser sessions: the seam between the worker pool and a real browser.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info};

use mineassembler_shared::{ScrapeConfig, ScrapeError};

/// Evaluated in the map page. Resolves to `{lib, lat, lng, zoom}` or `null`.
pub const MAP_CENTER_SCRIPT: &str = r#"async () => {
  function findLeaflet() {
    const m = (window.map && typeof window.map.getCenter === 'function')
      ? window.map
      : Object.values(window).find(v => v && typeof v.getCenter === 'function' && typeof v.eachLayer === 'function');
    return m || null;
  }
  function findMapbox() {
    for (const v of Object.values(window)) {
      try {
        if (v && typeof v.getCenter === 'function' && typeof v.getZoom === 'function' && typeof v.on === 'function') {
          return v;
        }
      } catch (e) {}
    }
    return null;
  }
  const leaflet = findLeaflet();
  if (leaflet) {
    if (!leaflet._loaded && typeof leaflet.whenReady === 'function') {
      await new Promise(res => leaflet.whenReady(res));
    }
    const c = leaflet.getCenter();
    return { lib: 'Leaflet', lat: c.lat, lng: c.lng, zoom: leaflet.getZoom ? leaflet.getZoom() : null };
  }
  const mapbox = findMapbox();
  if (mapbox) {
    if (!mapbox.loaded && typeof mapbox.once === 'function') {
      await new Promise(res => mapbox.once('load', res));
    }
    const c = mapbox.getCenter();
    return { lib: 'MapboxGL', lat: c.lat, lng: c.lng, zoom: mapbox.getZoom() };
  }
  return null;
}"#;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One isolated browser session, owned by exactly one worker.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load `url` and return the rendered HTML.
    async fn content(&mut self, url: &str) -> Result<String, ScrapeError>;

    /// Load `url` and evaluate `script` in the page, returning its JSON result.
    async fn evaluate(&mut self, url: &str, script: &str) -> Result<Value, ScrapeError>;

    /// Release the session. Called exactly once, on recycle or shutdown.
    async fn close(&mut self);
}

/// Launches sessions for pool workers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn launch(&self, worker: usize) -> Result<Box<dyn BrowserSession>, ScrapeError>;
}

// ---------------------------------------------------------------------------
// Browserless
// ---------------------------------------------------------------------------

/// Sessions backed by a Browserless-compatible HTTP endpoint.
#[derive(Debug, Clone)]
pub struct BrowserlessFactory {
    base_url: String,
    token: Option<String>,
    page_timeout: Duration,
}

impl BrowserlessFactory {
    pub fn new(base_url: &str, token: Option<String>, page_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            page_timeout,
        }
    }

    /// Build from config, reading the token from the configured env var.
    pub fn from_config(config: &ScrapeConfig) -> Self {
        let token = std::env::var(&config.browser_token_env).ok();
        Self::new(
            &config.browser_url,
            token,
            Duration::from_secs(config.page_timeout_secs),
        )
    }
}

#[async_trait]
impl SessionFactory for BrowserlessFactory {
    async fn launch(&self, worker: usize) -> Result<Box<dyn BrowserSession>, ScrapeError> {
        // A dedicated client per session: no connection or cookie sharing.
        let client = Client::builder()
            .timeout(self.page_timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| ScrapeError::Crashed(format!("failed to build HTTP client: {e}")))?;
        info!(worker, endpoint = %self.base_url, "browser session launched");
        Ok(Box::new(BrowserlessSession {
            worker,
            client: Some(client),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            page_timeout: self.page_timeout,
        }))
    }
}

pub struct BrowserlessSession {
    worker: usize,
    client: Option<Client>,
    base_url: String,
    token: Option<String>,
    page_timeout: Duration,
}

impl BrowserlessSession {
    fn endpoint(&self, path: &str) -> String {
        match &self.token {
            Some(token) => format!("{}{path}?token={token}", self.base_url),
            None => format!("{}{path}", self.base_url),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, ScrapeError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ScrapeError::Crashed("session already closed".into()))?;
        let response = client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScrapeError::Timeout(self.page_timeout.as_millis() as u64)
                } else {
                    ScrapeError::Crashed(format!("{path}: {e}"))
                }
            })?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                Err(ScrapeError::Blocked(format!("{path}: HTTP {status}")))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(ScrapeError::Timeout(self.page_timeout.as_millis() as u64))
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(ScrapeError::Crashed(format!("{path}: HTTP {status}: {message}")))
            }
        }
    }
}

#[async_trait]
impl BrowserSession for BrowserlessSession {
    async fn content(&mut self, url: &str) -> Result<String, ScrapeError> {
        let body = json!({
            "url": url,
            "gotoOptions": {
                "waitUntil": "networkidle2",
                "timeout": self.page_timeout.as_millis() as u64,
            },
        });
        let response = self.post("/content", &body).await?;
        let html = response
            .text()
            .await
            .map_err(|e| ScrapeError::Crashed(format!("failed to read page body: {e}")))?;
        debug!(worker = self.worker, url, bytes = html.len(), "page rendered");
        Ok(html)
    }

    async fn evaluate(&mut self, url: &str, script: &str) -> Result<Value, ScrapeError> {
        let code = format!(
            "export default async function ({{ page, context }}) {{\n\
             await page.goto(context.url, {{ waitUntil: 'domcontentloaded' }});\n\
             const data = await page.evaluate({script});\n\
             return {{ data, type: 'application/json' }};\n\
             }}"
        );
        let body = json!({ "code": code, "context": { "url": url } });
        let response = self.post("/function", &body).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ScrapeError::NotRendered(format!("script result is not JSON: {e}")))
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!(worker = self.worker, "browser session closed");
        }
    }
}
