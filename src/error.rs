use thiserror::Error;
use tracing::{error, warn};

/// Errors returned by every public entry point.
///
/// Each variant carries the URL it concerns and maps to a stable code via
/// [`OgieError::code`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OgieError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to fetch {url}: {message}")]
    FetchError {
        url: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Too many redirects fetching {url} (limit: {max_redirects})")]
    RedirectLimit { url: String, max_redirects: usize },

    #[error("Failed to parse {url}: {message}")]
    ParseError { url: String, message: String },
}

impl OgieError {
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        OgieError::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        OgieError::FetchError {
            url: url.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        OgieError::FetchError {
            url: url.into(),
            message: format!("HTTP status {status}"),
            status: Some(status),
        }
    }

    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        OgieError::ParseError {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            OgieError::InvalidUrl { .. } => "INVALID_URL",
            OgieError::FetchError { .. } => "FETCH_ERROR",
            OgieError::Timeout { .. } => "TIMEOUT",
            OgieError::RedirectLimit { .. } => "REDIRECT_LIMIT",
            OgieError::ParseError { .. } => "PARSE_ERROR",
        }
    }

    /// The URL the error refers to.
    pub fn url(&self) -> &str {
        match self {
            OgieError::InvalidUrl { url, .. }
            | OgieError::FetchError { url, .. }
            | OgieError::Timeout { url, .. }
            | OgieError::RedirectLimit { url, .. }
            | OgieError::ParseError { url, .. } => url,
        }
    }

    /// HTTP status code for non-2xx fetch failures.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            OgieError::FetchError { status, .. } => *status,
            _ => None,
        }
    }

    pub fn log(&self) {
        match self {
            OgieError::InvalidUrl { url, reason } => {
                warn!(url = %url, reason = %reason, "URL rejected");
            }
            OgieError::FetchError {
                url,
                message,
                status,
            } => {
                error!(url = %url, status = ?status, error = %message, "Content fetch failed");
            }
            OgieError::Timeout { url, timeout_ms } => {
                warn!(url = %url, timeout_ms = timeout_ms, "Request timed out");
            }
            OgieError::RedirectLimit { url, max_redirects } => {
                warn!(url = %url, max_redirects = max_redirects, "Redirect limit exceeded");
            }
            OgieError::ParseError { url, message } => {
                error!(url = %url, error = %message, "Metadata extraction failed");
            }
        }
    }
}
