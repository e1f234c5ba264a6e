//! The request execution pipeline.
//!
//! A logical send runs the request hooks once, then tries the request until
//! it succeeds, fails with an error the retry policy does not allow, or the
//! retry budget is used up. Every try goes through a cached transport of the
//! [`TransportPool`] and races the caller's cancellation token against the
//! per-request timeout. The final response passes the response hooks.

use std::sync::Arc;

use tokio::time::Instant;

use crate::{
    ErrorKind, ExecutionOutcome, PendingRequest, Response, Result,
    hooks::{HookChain, RequestHook, ResponseHook},
    proxy::{RoutingTarget, TrackedTarget},
    retry::classify::{TransportResult, classify},
    transport::{TransportKey, TransportOptions, TransportPool},
};

/// Executes pending requests with retries, hooks and health reporting
#[derive(Debug, Default)]
pub struct Executor {
    transports: Arc<TransportPool>,
    request_hooks: HookChain<dyn RequestHook>,
    response_hooks: HookChain<dyn ResponseHook>,
}

impl Executor {
    /// Create an executor building transports with the given options
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self::with_pool(Arc::new(TransportPool::new(options)))
    }

    /// Create an executor using an existing, possibly shared, transport pool
    #[must_use]
    pub fn with_pool(transports: Arc<TransportPool>) -> Self {
        Self {
            transports,
            request_hooks: HookChain::default(),
            response_hooks: HookChain::default(),
        }
    }

    /// Register a hook run before every logical send
    pub fn add_request_hook(&self, hook: Arc<dyn RequestHook>) {
        self.request_hooks.push(hook);
    }

    /// Register a hook run on every final response
    pub fn add_response_hook(&self, hook: Arc<dyn ResponseHook>) {
        self.response_hooks.push(hook);
    }

    /// The cached transports
    #[must_use]
    pub fn transports(&self) -> &TransportPool {
        &self.transports
    }

    /// Execute one logical send.
    ///
    /// # Errors
    ///
    /// Returns the last classified error once the request failed for good,
    /// [`ErrorKind::CallerCancelled`] if the caller cancelled it, or
    /// [`ErrorKind::Hook`] if a hook refused it.
    pub async fn execute(&self, mut request: PendingRequest) -> Result<Response> {
        if request.is_cancelled() {
            return Err(ErrorKind::CallerCancelled);
        }

        self.request_hooks.run(&mut request).await?;

        let mut attempt = 0;
        loop {
            match self.attempt(&request, attempt).await {
                ExecutionOutcome::Success(mut response) => {
                    self.response_hooks.run(&mut response, &request).await?;
                    return Ok(response);
                }
                ExecutionOutcome::TerminalFailure(error) => return Err(error),
                ExecutionOutcome::RetryableFailure { error, attempt: failed } => {
                    attempt = failed + 1;
                    let backoff = request.retry.delay(attempt);
                    let wait = error.retry_after().map_or(backoff, |hint| hint.max(backoff));
                    log::debug!(
                        "{request}: try {} failed ({error}), retrying in {}ms",
                        failed + 1,
                        wait.as_millis()
                    );

                    tokio::select! {
                        () = request.cancellation.cancelled() => return Err(ErrorKind::CallerCancelled),
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Run a single try of `request`. `attempt` is zero-based.
    pub async fn attempt(&self, request: &PendingRequest, attempt: u32) -> ExecutionOutcome {
        let tracked = request.target.as_deref();
        let routing = tracked.map_or(&RoutingTarget::Direct, TrackedTarget::target);

        let result = match self.send(request, routing, attempt).await {
            Ok(result) => result,
            Err(error) => return ExecutionOutcome::TerminalFailure(error),
        };

        let error = match classify(result, routing) {
            Ok(response) => {
                if response.is_success()
                    && let Some(tracked) = tracked
                {
                    tracked.report_success();
                }
                return ExecutionOutcome::Success(response);
            }
            Err(error) => error,
        };

        if let Some(tracked) = tracked
            && error.category().is_proxy()
        {
            tracked.report_failure();
        }

        if request.retry.allows(&error) && attempt + 1 < request.retry.max_attempts() {
            ExecutionOutcome::RetryableFailure { error, attempt }
        } else {
            ExecutionOutcome::TerminalFailure(error)
        }
    }

    async fn send(
        &self,
        request: &PendingRequest,
        routing: &RoutingTarget,
        attempt: u32,
    ) -> Result<TransportResult> {
        let client = self
            .transports
            .get(&TransportKey::for_request(request, routing))?;
        let http_request = request.to_reqwest(&client)?;

        log::debug!("{request}: try {} via {routing}", attempt + 1);
        let started = Instant::now();
        let exchange = async {
            let response = client.execute(http_request).await?;
            Response::from_reqwest(response, attempt + 1, started).await
        };
        let bounded = async {
            let received = match request.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                    Ok(received) => received,
                    Err(_) => return TransportResult::TimedOut(Some(timeout)),
                },
                None => exchange.await,
            };
            received.map_or_else(TransportResult::Failed, TransportResult::Received)
        };

        Ok(tokio::select! {
            biased;
            () = request.cancellation.cancelled() => TransportResult::Cancelled,
            result = bounded => result,
        })
    }
}
