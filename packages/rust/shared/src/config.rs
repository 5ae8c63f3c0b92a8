//! Application configuration for the assembler.
//!
//! User config lives at `~/.mineassembler/mineassembler.toml`.
//! CLI flags override config file values, which override defaults.
//! The merged result is read once at startup and never changes afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AssemblyError, Result};
use crate::types::SourceKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "mineassembler.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".mineassembler";

// ---------------------------------------------------------------------------
// Config structs (matching mineassembler.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub scrape: ScrapeConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for JSON outputs, reports and the local database.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Countries whose listings are queried. Empty means "only what leads name".
    #[serde(default = "default_countries")]
    pub countries: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            countries: default_countries(),
        }
    }
}

fn default_output_dir() -> String {
    "outputs".into()
}
fn default_countries() -> Vec<String> {
    vec!["Australia".into(), "Canada".into()]
}

/// `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Name of the env var holding the bearer token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Per-call timeout.
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Total attempts per call, first try included.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Insert a pause after every N calls.
    #[serde(default = "default_pacing_every")]
    pub pacing_every: u32,

    #[serde(default = "default_pacing_pause")]
    pub pacing_pause_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            token_env: default_token_env(),
            timeout_secs: default_api_timeout(),
            retry_attempts: default_retry_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            pacing_every: default_pacing_every(),
            pacing_pause_ms: default_pacing_pause(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://mininghub.com/api".into()
}
fn default_token_env() -> String {
    "JWT_TOKEN".into()
}
fn default_api_timeout() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    4
}
fn default_backoff_base() -> u64 {
    2_000
}
fn default_backoff_cap() -> u64 {
    30_000
}
fn default_pacing_every() -> u32 {
    1
}
fn default_pacing_pause() -> u64 {
    500
}

/// `[scrape]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Headless browser service exposing `/content` and `/function`.
    #[serde(default = "default_browser_url")]
    pub browser_url: String,

    /// Env var holding the browser service token, if it needs one.
    #[serde(default = "default_browser_token_env")]
    pub browser_token_env: String,

    /// Site hosting project profile and map pages.
    #[serde(default = "default_base_host")]
    pub base_host: String,

    /// Number of browser sessions (~600 MB each).
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,

    #[serde(default = "default_map_timeout")]
    pub map_timeout_secs: u64,

    /// How many times a failed item may be handed to another worker.
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,

    /// Relaunch a session after this many completed tasks.
    #[serde(default = "default_recycle_after")]
    pub recycle_after: u32,

    /// Minimum gap between two requests from the same worker.
    #[serde(default = "default_politeness")]
    pub politeness_ms: u64,

    /// Look up the map centre for projects without coordinates.
    #[serde(default = "default_true")]
    pub map_center: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            browser_url: default_browser_url(),
            browser_token_env: default_browser_token_env(),
            base_host: default_base_host(),
            workers: default_workers(),
            page_timeout_secs: default_page_timeout(),
            map_timeout_secs: default_map_timeout(),
            max_requeues: default_max_requeues(),
            recycle_after: default_recycle_after(),
            politeness_ms: default_politeness(),
            map_center: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_browser_url() -> String {
    "http://localhost:3000".into()
}
fn default_browser_token_env() -> String {
    "BROWSER_TOKEN".into()
}
fn default_base_host() -> String {
    "https://mininghub.com".into()
}
fn default_workers() -> usize {
    4
}
fn default_page_timeout() -> u64 {
    45
}
fn default_map_timeout() -> u64 {
    7
}
fn default_max_requeues() -> u32 {
    2
}
fn default_recycle_after() -> u32 {
    50
}
fn default_politeness() -> u64 {
    250
}

/// `[geocoding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Nominatim-compatible base URL.
    #[serde(default = "default_geocode_endpoint")]
    pub endpoint: String,

    /// Decimal places used to bucket coordinates for the cache.
    #[serde(default = "default_precision")]
    pub precision: u32,

    /// Minimum gap between two remote lookups.
    #[serde(default = "default_geocode_interval")]
    pub min_interval_ms: u64,

    #[serde(default = "default_geocode_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_geocode_endpoint(),
            precision: default_precision(),
            min_interval_ms: default_geocode_interval(),
            timeout_secs: default_geocode_timeout(),
        }
    }
}

fn default_geocode_endpoint() -> String {
    "https://nominatim.openstreetmap.org".into()
}
fn default_precision() -> u32 {
    3
}
fn default_geocode_interval() -> u64 {
    1_000
}
fn default_geocode_timeout() -> u64 {
    10
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Identifiers resolved concurrently within a batch. Scrape work is further
    /// bounded by `scrape.workers`.
    #[serde(default = "default_api_concurrency")]
    pub api_concurrency: usize,

    /// Pause between batches.
    #[serde(default = "default_batch_pause")]
    pub pause_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            api_concurrency: default_api_concurrency(),
            pause_ms: default_batch_pause(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_api_concurrency() -> usize {
    8
}
fn default_batch_pause() -> u64 {
    2_000
}

/// `[resolver]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Precedence for non-company fields, highest first.
    #[serde(default = "default_field_authority")]
    pub field_authority: Vec<SourceKind>,

    /// Turn the listing `operator` into an attribution when nothing else names a company.
    #[serde(default = "default_true")]
    pub operator_fallback: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            field_authority: default_field_authority(),
            operator_fallback: true,
        }
    }
}

fn default_field_authority() -> Vec<SourceKind> {
    vec![
        SourceKind::Relationships,
        SourceKind::Listing,
        SourceKind::Scrape,
    ]
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.mineassembler/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AssemblyError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.mineassembler/mineassembler.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AssemblyError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        AssemblyError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AssemblyError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AssemblyError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AssemblyError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject settings that would make the pipeline stall or loop forever.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.batch.size == 0 {
        return Err(AssemblyError::config("batch.size must be at least 1"));
    }
    if config.batch.api_concurrency == 0 {
        return Err(AssemblyError::config("batch.api_concurrency must be at least 1"));
    }
    if config.scrape.enabled && config.scrape.workers == 0 {
        return Err(AssemblyError::config("scrape.workers must be at least 1"));
    }
    if config.api.retry_attempts == 0 {
        return Err(AssemblyError::config("api.retry_attempts must be at least 1"));
    }
    if config.geocoding.precision > 8 {
        return Err(AssemblyError::config("geocoding.precision must be 8 or less"));
    }
    let authority = &config.resolver.field_authority;
    for source in [SourceKind::Relationships, SourceKind::Listing, SourceKind::Scrape] {
        if authority.iter().filter(|s| **s == source).count() != 1 {
            return Err(AssemblyError::config(format!(
                "resolver.field_authority must list `{source}` exactly once"
            )));
        }
    }
    if authority.contains(&SourceKind::Geocoding) {
        return Err(AssemblyError::config(
            "resolver.field_authority only ranks relationships, listing and scrape",
        ));
    }
    Ok(())
}

/// Read the bearer token from the env var named in `[api] token_env`.
pub fn validate_credential(config: &AppConfig) -> Result<String> {
    let var_name = &config.api.token_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(AssemblyError::config(format!(
            "API token not found. Set the {var_name} environment variable."
        ))),
    }
}
