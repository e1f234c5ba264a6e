use std::time::Duration;

use crate::{BackoffStrategy, PendingRequest, RetryPolicy};

#[macro_export]
/// Creates a mock web server, which responds with a predefined status when
/// handling any request
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::any()).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Install a test logger, ignoring repeated initialization
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A retry policy with short fixed waits, so tests finish quickly
pub(crate) fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_retries(max_retries)
        .with_backoff(
            BackoffStrategy::Fixed,
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
}

/// A `GET` request for the given URL using [`fast_retry`]
///
/// # Panic
///
/// This panics on an invalid URL, so it should only be used for testing
pub(crate) fn get(url: &str, max_retries: u32) -> PendingRequest {
    PendingRequest::try_from(url)
        .expect("Expected valid URL")
        .with_retry(fast_retry(max_retries))
}
