//! Handle rate limiting headers sent along with `429 Too Many Requests`.

use http::{HeaderMap, HeaderValue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Wait used when a `429` response carries no usable hint.
pub(crate) const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Parse the "Retry-After" header as specified per
/// [RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3)
pub(crate) fn parse_retry_after(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?;

    // RFC 7231: Retry-After = HTTP-date / delay-seconds
    value.parse::<u64>().map(Duration::from_secs).or_else(|_| {
        httpdate::parse_http_date(value)
            .map(|s| {
                s.duration_since(SystemTime::now())
                    // if date is in the past, we can use ZERO
                    .unwrap_or(Duration::ZERO)
            })
            .map_err(|_| RetryAfterParseError::ValueError(value.into()))
    })
}

/// Parse an "X-RateLimit-Reset" header holding a unix timestamp in seconds
/// and turn it into the remaining wait.
pub(crate) fn parse_rate_limit_reset(
    value: &HeaderValue,
) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?;
    let reset = value
        .trim()
        .parse::<u64>()
        .map_err(|_| RetryAfterParseError::ValueError(value.into()))?;

    let reset_at = UNIX_EPOCH + Duration::from_secs(reset);
    Ok(reset_at
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO))
}

/// Determine how long to wait before retrying a rate limited request.
///
/// `Retry-After` wins over `X-RateLimit-Reset`. Without either header (or
/// with unparseable values) the default of 60 seconds is used.
pub(crate) fn resume_delay(headers: &HeaderMap) -> Duration {
    if let Some(value) = headers.get(http::header::RETRY_AFTER) {
        match parse_retry_after(value) {
            Ok(delay) => return delay,
            Err(e) => log::debug!("Ignoring Retry-After header: {e}"),
        }
    }

    if let Some(value) = headers.get("x-ratelimit-reset") {
        match parse_rate_limit_reset(value) {
            Ok(delay) => return delay,
            Err(e) => log::debug!("Ignoring X-RateLimit-Reset header: {e}"),
        }
    }

    DEFAULT_RATE_LIMIT_DELAY
}
