use std::{convert::TryFrom, fmt::Display, sync::Arc, time::Duration};

use http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{self, IntoHeaderName},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{ErrorKind, Result, RetryPolicy, proxy::TrackedTarget};

/// HTTP protocol version a request should be sent with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpVersion {
    /// Let the transport negotiate (HTTP/1.1, or HTTP/2 via ALPN)
    #[default]
    Auto,
    /// Only speak HTTP/1.x
    Http1,
    /// Speak HTTP/2 with prior knowledge
    Http2,
}

/// A fully resolved request waiting to be sent.
///
/// Values are cheap to clone: the cancellation token and routing target are
/// shared, so a clone observes the same cancellation and reports into the same
/// health tracker.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// HTTP method, e.g. `GET` or `POST`
    pub method: Method,

    /// Absolute target URL
    pub url: Url,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body, empty for body-less requests
    pub body: Vec<u8>,

    /// Upper bound for a single try, including reading the full body
    pub timeout: Option<Duration>,

    /// Cancelled by the caller to abort the request at any suspension point
    pub cancellation: CancellationToken,

    /// Routing target the request is sent through. `None` lets the engine
    /// choose (rotator or direct).
    pub target: Option<Arc<TrackedTarget>>,

    /// How failed tries are retried
    pub retry: RetryPolicy,

    /// When `false`, any server certificate is accepted
    pub validate_certificates: bool,

    /// Whether redirects are followed by the transport
    pub follow_redirects: bool,

    /// Protocol version to use
    pub version: HttpVersion,
}

impl PendingRequest {
    /// Create a request with the given method and URL and default settings.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
            timeout: None,
            cancellation: CancellationToken::new(),
            target: None,
            retry: RetryPolicy::default(),
            validate_certificates: true,
            follow_redirects: true,
            version: HttpVersion::Auto,
        }
    }

    /// Create a `GET` request for the given URL
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a `POST` request for the given URL with the given body
    #[must_use]
    pub fn post(url: Url, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    /// Set a header, replacing any previous value with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid header value.
    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: &str) -> Result<Self> {
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(self)
    }

    /// Set a header from a raw name and value.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or value is not valid.
    pub fn with_raw_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(self)
    }

    /// Set the request body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the per-try timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use the given cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Route the request through the given tracked target
    #[must_use]
    pub fn with_target(mut self, target: Arc<TrackedTarget>) -> Self {
        self.target = Some(target);
        self
    }

    /// Use the given retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable certificate validation
    #[must_use]
    pub fn with_certificate_validation(mut self, validate: bool) -> Self {
        self.validate_certificates = validate;
        self
    }

    /// Enable or disable following redirects
    #[must_use]
    pub fn with_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Use the given protocol version
    #[must_use]
    pub fn with_version(mut self, version: HttpVersion) -> Self {
        self.version = version;
        self
    }

    /// Lowercased host of the target URL, used to partition per-host state.
    #[must_use]
    pub fn host(&self) -> Option<String> {
        self.url.host_str().map(str::to_lowercase)
    }

    /// Whether the caller has cancelled this request
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Build the `reqwest` request for one try.
    pub(crate) fn to_reqwest(&self, client: &reqwest::Client) -> Result<reqwest::Request> {
        let mut builder = client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if !self.body.is_empty() {
            builder = builder.body(self.body.clone());
        }
        builder.build().map_err(ErrorKind::BuildRequest)
    }

    /// Append a value to the `Cookie` header, keeping existing cookies.
    pub(crate) fn merge_cookie_header(&mut self, cookies: &str) -> Result<()> {
        let merged = match self.headers.get(header::COOKIE).map(HeaderValue::to_str) {
            Some(Ok(existing)) if !existing.is_empty() => format!("{existing}; {cookies}"),
            _ => cookies.to_string(),
        };
        self.headers
            .insert(header::COOKIE, HeaderValue::from_str(&merged)?);
        Ok(())
    }
}

impl Display for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

impl From<Url> for PendingRequest {
    fn from(url: Url) -> Self {
        Self::get(url)
    }
}

impl TryFrom<&str> for PendingRequest {
    type Error = ErrorKind;

    fn try_from(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| ErrorKind::InvalidUrl(s.to_string(), e))?;
        if url.host_str().is_none() {
            return Err(ErrorKind::InvalidUrlHost);
        }
        Ok(Self::get(url))
    }
}

impl TryFrom<String> for PendingRequest {
    type Error = ErrorKind;

    fn try_from(s: String) -> Result<Self> {
        Self::try_from(s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, header};

    use super::PendingRequest;
    use crate::ErrorKind;

    #[test]
    fn test_try_from_str() {
        let request = PendingRequest::try_from("https://Example.com/path").unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.host().as_deref(), Some("example.com"));
        assert!(request.follow_redirects);
        assert!(request.validate_certificates);
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            PendingRequest::try_from("not a url"),
            Err(ErrorKind::InvalidUrl(_, _))
        ));
        assert!(matches!(
            PendingRequest::try_from("mailto:someone@example.com"),
            Err(ErrorKind::InvalidUrlHost)
        ));
    }

    #[test]
    fn test_merge_cookie_header() {
        let mut request = PendingRequest::try_from("https://example.com")
            .unwrap()
            .with_header(header::COOKIE, "a=1")
            .unwrap();
        request.merge_cookie_header("b=2").unwrap();
        assert_eq!(request.headers[header::COOKIE], "a=1; b=2");

        let mut request = PendingRequest::try_from("https://example.com").unwrap();
        request.merge_cookie_header("b=2").unwrap();
        assert_eq!(request.headers[header::COOKIE], "b=2");
    }

    #[test]
    fn test_clone_shares_cancellation() {
        let request = PendingRequest::try_from("https://example.com").unwrap();
        let clone = request.clone();
        request.cancellation.cancel();
        assert!(clone.is_cancelled());
    }
}
