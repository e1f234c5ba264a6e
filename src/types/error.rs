use std::time::Duration;

use serde::{Serialize, Serializer};
use strum::{Display, EnumIs};
use thiserror::Error;

/// Boxed error type returned by hooks, callbacks and other user-supplied code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse failure taxonomy used for retry decisions and reporting.
///
/// Only [`FailureCategory::Timeout`], [`FailureCategory::RateLimited`],
/// [`FailureCategory::Proxy`] and [`FailureCategory::Network`] can ever be
/// retried; the other two always end a logical send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIs, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The caller cancelled the request
    CallerCancelled,
    /// The per-request timeout elapsed, or the transport timed out connecting
    Timeout,
    /// The server answered with `429 Too Many Requests`
    RateLimited,
    /// The forward proxy failed or refused the request
    Proxy,
    /// Any other transport-level failure
    Network,
    /// Unrecognized failure which is never retried
    Terminal,
}

/// Possible errors when executing requests with `volley`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller's cancellation token fired before the request completed
    #[error("Request was cancelled by the caller")]
    CallerCancelled,

    /// The request did not complete within its timeout
    #[error("Request timed out{}", match .0 {
        Some(timeout) => format!(" after {}ms", timeout.as_millis()),
        None => String::new(),
    })]
    Timeout(Option<Duration>),

    /// The server rejected the request with `429 Too Many Requests`
    #[error("Rate limited by server, retry after {}s", .retry_after.as_secs_f64())]
    RateLimited {
        /// How long the server asked us to wait before trying again
        retry_after: Duration,
    },

    /// The request failed inside or because of the forward proxy
    #[error("Proxy error via {proxy}: {reason}")]
    Proxy {
        /// Identity of the proxy the request was routed through
        proxy: String,
        /// Description of the failure
        reason: String,
    },

    /// Network error while trying to reach an endpoint via reqwest
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    /// A request or response hook refused the request
    #[error("Hook failed: {0}")]
    Hook(#[source] BoxError),

    /// The HTTP client for a routing target could not be constructed
    #[error("Failed to build HTTP client: {0}")]
    BuildTransport(#[source] reqwest::Error),

    /// The request could not be turned into a `reqwest` request
    #[error("Failed to build request: {0}")]
    BuildRequest(#[source] reqwest::Error),

    /// The given string could not be parsed into a URL
    #[error("Cannot parse '{0}' as URL: {1}")]
    InvalidUrl(String, #[source] url::ParseError),

    /// The URL does not have a host component
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The given header could not be parsed
    #[error("Header could not be parsed: {0}")]
    InvalidHeader(String),

    /// The proxy descriptor could not be turned into a proxy URL
    #[error("Invalid proxy {0}: {1}")]
    InvalidProxy(String, String),

    /// A batch with this name already exists
    #[error("Batch '{0}' already exists")]
    BatchExists(String),

    /// The configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// A spawned request task panicked or was aborted
    #[error("Request task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ErrorKind {
    /// Map this error into the failure taxonomy.
    #[must_use]
    pub const fn category(&self) -> FailureCategory {
        match self {
            Self::CallerCancelled => FailureCategory::CallerCancelled,
            Self::Timeout(_) => FailureCategory::Timeout,
            Self::RateLimited { .. } => FailureCategory::RateLimited,
            Self::Proxy { .. } => FailureCategory::Proxy,
            Self::Network(_) => FailureCategory::Network,
            _ => FailureCategory::Terminal,
        }
    }

    /// The resume hint attached to a rate limit error, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Return the underlying `reqwest` error, if any.
    #[must_use]
    pub const fn reqwest_error(&self) -> Option<&reqwest::Error> {
        match self {
            Self::Network(e) | Self::BuildTransport(e) | Self::BuildRequest(e) => Some(e),
            _ => None,
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<http::header::InvalidHeaderValue> for ErrorKind {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(e.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for ErrorKind {
    fn from(e: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ErrorKind, FailureCategory};

    #[test]
    fn test_category() {
        assert_eq!(
            ErrorKind::CallerCancelled.category(),
            FailureCategory::CallerCancelled
        );
        assert_eq!(
            ErrorKind::Timeout(None).category(),
            FailureCategory::Timeout
        );
        assert_eq!(
            ErrorKind::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .category(),
            FailureCategory::RateLimited
        );
        assert_eq!(
            ErrorKind::Hook("nope".into()).category(),
            FailureCategory::Terminal
        );
        assert!(ErrorKind::InvalidUrlHost.category().is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ErrorKind::Timeout(Some(Duration::from_millis(250))).to_string(),
            "Request timed out after 250ms"
        );
        assert_eq!(ErrorKind::Timeout(None).to_string(), "Request timed out");
        assert_eq!(FailureCategory::RateLimited.to_string(), "rate_limited");
    }
}
