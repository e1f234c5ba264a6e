use std::error::Error as _;
use std::time::Duration;

use http::StatusCode;

use crate::{ErrorKind, Response, proxy::RoutingTarget, ratelimit::headers};

/// What a single try of the transport produced, before classification.
#[derive(Debug)]
pub(crate) enum TransportResult {
    /// A complete, buffered response
    Received(Response),
    /// The transport failed
    Failed(reqwest::Error),
    /// The per-request timeout elapsed first
    TimedOut(Option<Duration>),
    /// The caller cancelled first
    Cancelled,
}

/// Turn the result of one try into a response or a classified error.
///
/// Checks run in priority order: cancellation, `429`, timeout, proxy
/// failure, other transport failure. Every other response status is passed
/// through for the caller to interpret.
pub(crate) fn classify(
    result: TransportResult,
    target: &RoutingTarget,
) -> Result<Response, ErrorKind> {
    match result {
        TransportResult::Cancelled => Err(ErrorKind::CallerCancelled),
        TransportResult::Received(response) => match response.status {
            StatusCode::TOO_MANY_REQUESTS => Err(ErrorKind::RateLimited {
                retry_after: headers::resume_delay(&response.headers),
            }),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => Err(ErrorKind::Proxy {
                proxy: target.to_string(),
                reason: "proxy authentication required (407)".to_string(),
            }),
            _ => Ok(response),
        },
        TransportResult::TimedOut(timeout) => Err(ErrorKind::Timeout(timeout)),
        TransportResult::Failed(error) => Err(classify_error(error, target)),
    }
}

fn classify_error(error: reqwest::Error, target: &RoutingTarget) -> ErrorKind {
    if error.is_timeout() {
        return ErrorKind::Timeout(None);
    }
    if error.status() == Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED) {
        return ErrorKind::Proxy {
            proxy: target.to_string(),
            reason: error_chain(&error),
        };
    }
    if error.is_builder() {
        return ErrorKind::BuildRequest(error);
    }

    // With a proxy configured, the transport only ever connects to the proxy
    let chain = error_chain(&error);
    if mentions_proxy(&chain) || (error.is_connect() && target.is_proxy()) {
        ErrorKind::Proxy {
            proxy: target.to_string(),
            reason: chain,
        }
    } else {
        ErrorKind::Network(error)
    }
}

/// Join the messages of an error and all of its sources.
///
/// `reqwest` wraps connector failures several levels deep, so the proxy
/// hint is usually only found in a source.
fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn mentions_proxy(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("proxy") || message.contains("407")
}
