use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Message substituted for internal failures before they reach a caller.
pub const GENERIC_INTERNAL_MESSAGE: &str = "An internal error occurred while processing the request";

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    Validation(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Upstream server returned HTTP {status}")]
    UpstreamHttp { status: u16 },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Rendering unavailable: no browser pool configured")]
    RenderingUnavailable,

    #[error("Rendering timed out after {0:?}")]
    RenderingTimeout(Duration),

    #[error("Selector '{selector}' did not appear within {timeout:?}")]
    SelectorTimeout { selector: String, timeout: Duration },

    #[error("Rendering failed: {0}")]
    RenderingFailed(String),

    #[error("No browser available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Browser pool is closed")]
    PoolClosed,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job store error: {0}")]
    JobStore(String),

    #[error("Concurrent modification of job {0}")]
    JobConflict(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification stored with every failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    UpstreamHttp,
    Rendering,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UpstreamHttp => "upstream_http",
            ErrorKind::Rendering => "rendering",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Validation(_) => ErrorKind::Validation,
            FetchError::Timeout(_)
            | FetchError::RenderingTimeout(_)
            | FetchError::SelectorTimeout { .. } => ErrorKind::Timeout,
            FetchError::UpstreamHttp { .. } | FetchError::Download(_) => ErrorKind::UpstreamHttp,
            FetchError::RenderingUnavailable
            | FetchError::RenderingFailed(_)
            | FetchError::PoolExhausted(_)
            | FetchError::PoolClosed
            | FetchError::BrowserLaunchFailed(_) => ErrorKind::Rendering,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::Conversion(_)
            | FetchError::Configuration(_)
            | FetchError::JobStore(_)
            | FetchError::JobConflict(_)
            | FetchError::JobNotFound(_)
            | FetchError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-style status reported to callers. Upstream errors other than
    /// 401/403/404 collapse to 502 because the service acts as a proxy.
    pub fn status_code(&self) -> u16 {
        match self {
            FetchError::Validation(_) => 400,
            FetchError::Timeout(_)
            | FetchError::RenderingTimeout(_)
            | FetchError::SelectorTimeout { .. } => 408,
            FetchError::UpstreamHttp { status } => map_upstream_status(*status),
            FetchError::Download(_) => 502,
            FetchError::PoolExhausted(_) | FetchError::PoolClosed => 503,
            FetchError::JobNotFound(_) => 404,
            FetchError::JobConflict(_) => 409,
            FetchError::Cancelled => 499,
            FetchError::RenderingUnavailable
            | FetchError::RenderingFailed(_)
            | FetchError::BrowserLaunchFailed(_)
            | FetchError::Conversion(_)
            | FetchError::Configuration(_)
            | FetchError::JobStore(_)
            | FetchError::Internal(_) => 500,
        }
    }

    /// Message safe to hand to an external caller.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => GENERIC_INTERNAL_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_)
                | FetchError::RenderingTimeout(_)
                | FetchError::PoolExhausted(_)
                | FetchError::Download(_)
                | FetchError::JobConflict(_)
        )
    }

    /// Whether an automatic render may be abandoned in favour of the
    /// plain-fetched document. A selector the caller asked for is never
    /// silently dropped.
    pub fn allows_static_fallback(&self) -> bool {
        matches!(
            self,
            FetchError::RenderingUnavailable
                | FetchError::RenderingTimeout(_)
                | FetchError::RenderingFailed(_)
                | FetchError::PoolExhausted(_)
                | FetchError::PoolClosed
        )
    }
}

pub fn map_upstream_status(status: u16) -> u16 {
    match status {
        401 | 403 | 404 => status,
        _ => 502,
    }
}

impl From<AcquireError> for FetchError {
    fn from(_: AcquireError) -> Self {
        FetchError::Cancelled
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Internal(format!("serialization: {err}"))
    }
}

impl From<chromiumoxide::error::CdpError> for FetchError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        FetchError::RenderingFailed(err.to_string())
    }
}
