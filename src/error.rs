//! Error types for the catalog edge layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the catalog edge layer
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Outbound HTTP error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Remote cache tier unreachable
    #[error("Remote cache tier unavailable: {0}")]
    CacheUnavailable(String),

    /// Remote payload could not be decoded
    #[error("Corrupt cache payload for key {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// Rate limit exceeded
    #[error("Rate limit exceeded for {identity}: retry after {retry_after_secs}s")]
    RateLimitExceeded {
        identity: String,
        remaining: u32,
        retry_after_secs: u64,
    },

    // =========================================================================
    // Backing Store Errors
    // =========================================================================
    /// Backing fetch timed out
    #[error("Backing fetch for {key} timed out after {timeout_ms}ms")]
    BackingFetchTimeout { key: String, timeout_ms: u64 },

    /// Backing fetch failed
    #[error("Backing fetch failed: {0}")]
    BackingFetch(String),

    /// Filter could not be interpreted
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Malformed client request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Load Balancer Errors
    // =========================================================================
    /// Selected instance is not serving
    #[error("Instance {instance_id} is unhealthy")]
    InstanceUnhealthy { instance_id: String },

    /// Every upstream is exhausted
    #[error("No upstream instance available: {0}")]
    NoUpstreamAvailable(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// HTTP status code this error surfaces as
    pub fn http_status(&self) -> u16 {
        match self {
            Error::RateLimitExceeded { .. } => 429,
            Error::InvalidFilter(_) | Error::InvalidRequest(_) | Error::Json(_) => 400,
            Error::BackingFetchTimeout { .. } => 504,
            Error::BackingFetch(_) | Error::InstanceUnhealthy { .. } => 502,
            Error::NoUpstreamAvailable(_) => 503,
            _ => 500,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded { .. }
                | Error::BackingFetchTimeout { .. }
                | Error::BackingFetch(_)
                | Error::NoUpstreamAvailable(_)
                | Error::CacheUnavailable(_)
        )
    }
}

/// Cloneable fetch failure shared with every singleflight waiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Fetch exceeded its deadline
    Timeout { key: String, timeout_ms: u64 },
    /// Fetch failed for any other reason
    Failed { status: u16, message: String },
}

impl From<&Error> for FetchError {
    fn from(err: &Error) -> Self {
        match err {
            Error::BackingFetchTimeout { key, timeout_ms } => FetchError::Timeout {
                key: key.clone(),
                timeout_ms: *timeout_ms,
            },
            Error::BackingFetch(message)
            | Error::InvalidFilter(message)
            | Error::NoUpstreamAvailable(message) => FetchError::Failed {
                status: err.http_status(),
                message: message.clone(),
            },
            other => FetchError::Failed {
                status: other.http_status(),
                message: other.to_string(),
            },
        }
    }
}

impl From<Error> for FetchError {
    fn from(err: Error) -> Self {
        FetchError::from(&err)
    }
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { key, timeout_ms } => {
                Error::BackingFetchTimeout { key, timeout_ms }
            }
            FetchError::Failed { status, message } => match status {
                400 => Error::InvalidFilter(message),
                503 => Error::NoUpstreamAvailable(message),
                _ => Error::BackingFetch(message),
            },
        }
    }
}
