//! Error types for the assembly pipeline.
//!
//! Library crates use [`AssemblyError`] via `thiserror` for process-level
//! failures. Source-specific failures ([`ApiError`], [`ScrapeError`],
//! [`GeocodeError`]) are identifier-level and are threaded through the
//! resolver as plain values. The CLI wraps everything with `color-eyre`.

use std::path::PathBuf;

/// Top-level error type for process-level failures.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside the retried API calls (client construction etc.).
    #[error("network error: {0}")]
    Network(String),

    /// Response or page parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data-model invariant violation.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The bearer credential was rejected. Fatal to the whole run.
    #[error("credential rejected by {endpoint}")]
    Unauthorized { endpoint: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AssemblyError>;

impl AssemblyError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the run must stop (after flushing completed projects).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Config { .. })
    }
}

// ---------------------------------------------------------------------------
// API errors
// ---------------------------------------------------------------------------

/// Failure of a single call against the remote project API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The identifier is unknown to the endpoint. Permanent, never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bearer credential was rejected. Never retried, fatal to the batch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// HTTP 429. Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network blip, timeout, 5xx or malformed body. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ApiError {
    /// `Transient` and `RateLimited` are retried; everything else propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }

    /// Short stable label used as a metrics key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited(_) => "rate_limited",
            Self::Transient(_) => "transient",
        }
    }
}

impl From<ApiError> for AssemblyError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized(endpoint) => AssemblyError::Unauthorized { endpoint },
            other => AssemblyError::Network(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Scrape errors
// ---------------------------------------------------------------------------

/// Failure of a browser-driven page scrape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScrapeError {
    /// The page did not finish loading within the configured timeout.
    #[error("page load timed out after {0} ms")]
    Timeout(u64),

    /// The page loaded but the expected profile markup never appeared.
    #[error("page not rendered: {0}")]
    NotRendered(String),

    /// The remote site refused the session (captcha, 403, access denied).
    #[error("blocked: {0}")]
    Blocked(String),

    /// The browser session died. The worker is recycled.
    #[error("browser session crashed: {0}")]
    Crashed(String),
}

impl ScrapeError {
    /// Whether the item should be requeued on a different worker.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Blocked(_) | Self::Crashed(_))
    }

    /// Short stable label used as a metrics key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "scrape_timeout",
            Self::NotRendered(_) => "scrape_not_rendered",
            Self::Blocked(_) => "scrape_blocked",
            Self::Crashed(_) => "scrape_crashed",
        }
    }
}

// ---------------------------------------------------------------------------
// Geocoding errors
// ---------------------------------------------------------------------------

/// Reverse geocoding failure. Non-fatal: the project keeps raw coordinates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeocodeError {
    #[error("geocoder unavailable: {0}")]
    Unavailable(String),
}
