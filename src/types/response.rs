use std::{fmt::Display, time::Duration};

use http::{HeaderMap, StatusCode, Version};
use url::Url;


/// A fully buffered HTTP response.
///
/// Unlike [`reqwest::Response`] this can be cloned and inspected any number
/// of times, which is what response hooks, callbacks and requeue predicates
/// need.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code of the final response
    pub status: StatusCode,
    /// Final URL after redirects
    pub url: Url,
    /// Protocol version the response was received with
    pub version: Version,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Number of tries it took to obtain this response, starting at 1
    pub attempts: u32,
    /// Time spent on the successful try
    pub elapsed: Duration,
}

impl Response {
    /// Buffer a `reqwest` response completely. `started` is when the try
    /// began.
    pub(crate) async fn from_reqwest(
        response: reqwest::Response,
        attempts: u32,
        started: tokio::time::Instant,
    ) -> std::result::Result<Self, reqwest::Error> {
        let status = response.status();
        let url = response.url().clone();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(Self {
            status,
            url,
            version,
            headers,
            body,
            attempts,
            elapsed: started.elapsed(),
        })
    }

    /// Whether the status code is in the 2xx or 3xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success() || self.status.is_redirection()
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Return a header value as string, if present and valid.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.status.as_u16(), self.url)?;
        if self.attempts > 1 {
            write!(f, " ({} attempts)", self.attempts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn response_with_status(status: StatusCode) -> Response {
    Response {
        status,
        url: Url::parse("https://example.com/").unwrap(),
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
        body: Vec::new(),
        attempts: 1,
        elapsed: Duration::ZERO,
    }
}
