//! The batch scheduler.
//!
//! An [`Engine`] owns named [`Batch`]es and drains them through one shared
//! [`RateLimiter`], concurrency bound and [`TransportPool`]. See the
//! crate-level documentation for an example.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    BoxError, ErrorKind, PendingRequest, Response, Result, RetryPolicy,
    batch::{
        Batch, Counters, Progress, RequeueDecision, Stats, observers::Observers,
        session::SessionStore, waiter::WaitGroup,
    },
    executor::Executor,
    hooks::{RequestHook, ResponseHook},
    proxy::ProxyRotator,
    ratelimit::{DEFAULT_RATE_LIMIT_WINDOW, RateLimiter},
    transport::{TransportOptions, TransportPool},
};

/// Default number of logical sends running at the same time, 64.
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;
/// Default timeout for requests which don't set their own, 30 seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default pause of the continuous drain when all batches are empty, 50ms.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// Builder for [`Engine`].
///
/// See crate-level documentation for usage example.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[builder(builder_method(doc = "
Create a builder for building `EngineBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `EngineBuilder`.
"))]
pub struct EngineBuilder {
    /// Maximum number of request starts per rate limit window.
    ///
    /// `0` disables rate limiting.
    rate_limit: usize,

    /// Length of a rate limit window.
    #[builder(default = DEFAULT_RATE_LIMIT_WINDOW)]
    rate_limit_window: Duration,

    /// Maximum number of logical sends in flight at the same time.
    ///
    /// Also the wave size of a drain-once run when rate limiting is off.
    #[builder(default = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,

    /// Retry policy for requests submitted as bare URLs.
    retry: RetryPolicy,

    /// Timeout for requests which don't set their own.
    #[builder(default = Some(DEFAULT_TIMEOUT))]
    timeout: Option<Duration>,

    /// Carry `Set-Cookie` values over to later requests to the same host.
    persist_cookies: bool,

    /// Send the previous URL requested from a host as `Referer` of the next
    /// request to that host.
    persist_referer: bool,

    /// Settings for building transports.
    ///
    /// Ignored if a `transport_pool` is given.
    transport: TransportOptions,

    /// Transport pool to use instead of a private one.
    ///
    /// Share a pool between engines to reuse their connections.
    transport_pool: Option<Arc<TransportPool>>,

    /// Routing targets for requests which don't specify one.
    ///
    /// Without a rotator, or if all of its targets are unavailable,
    /// requests go out directly.
    rotator: Option<Arc<ProxyRotator>>,

    /// Pause of the continuous drain while all batches are empty.
    #[builder(default = DEFAULT_IDLE_INTERVAL)]
    idle_interval: Duration,
}

impl Default for EngineBuilder {
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EngineBuilder {
    /// Instantiates an [`Engine`].
    #[must_use]
    pub fn engine(self) -> Engine {
        let Self {
            rate_limit,
            rate_limit_window,
            max_concurrency,
            retry,
            timeout,
            persist_cookies,
            persist_referer,
            transport,
            transport_pool,
            rotator,
            idle_interval,
        } = self;

        let transports =
            transport_pool.unwrap_or_else(|| Arc::new(TransportPool::new(transport)));
        let max_concurrency = max_concurrency.max(1);

        Engine {
            inner: Arc::new(Inner {
                executor: Executor::with_pool(transports),
                limiter: RateLimiter::new(rate_limit, rate_limit_window),
                permits: Arc::new(Semaphore::new(max_concurrency)),
                max_concurrency,
                batches: DashMap::new(),
                rotator,
                session: SessionStore::new(persist_cookies, persist_referer),
                observers: Observers::default(),
                counters: Counters::default(),
                retry,
                timeout,
                idle_interval,
                drain: Mutex::new(None),
            }),
        }
    }
}

/// Executes batches of HTTP requests.
///
/// Requests are queued into named batches and executed either
///
/// - once, with [`Engine::run_batch`] or [`Engine::run_all`], which take
///   everything currently queued and run it in waves, or
/// - continuously, with [`Engine::start`], which keeps pulling requests off
///   the batches in the background until [`Engine::stop`] is called.
///
/// Both modes and [`Engine::send`] share one rate limiter, one concurrency
/// bound and one transport pool. After every logical send the registered
/// requeue predicates decide whether the request goes back into its batch.
///
/// `Engine` is cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Default for Engine {
    fn default() -> Self {
        EngineBuilder::default().engine()
    }
}

impl Engine {
    /// Create a new, empty batch.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BatchExists`] if the name is taken.
    pub fn create_batch(&self, name: &str) -> Result<Arc<Batch>> {
        match self.inner.batches.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ErrorKind::BatchExists(name.to_string())),
            Entry::Vacant(entry) => Ok(entry.insert(Arc::new(Batch::new(name))).clone()),
        }
    }

    /// Get the batch with the given name, creating it if needed
    #[must_use]
    pub fn batch(&self, name: &str) -> Arc<Batch> {
        self.inner.batch(name)
    }

    /// Remove a batch. Requests still queued in it are never run, and
    /// requeues into it are dropped.
    pub fn remove_batch(&self, name: &str) -> Option<Arc<Batch>> {
        self.inner.batches.remove(name).map(|(_, batch)| batch)
    }

    /// Drop all requests queued in a batch and return how many there were
    pub fn clear_batch(&self, name: &str) -> usize {
        self.inner
            .batches
            .get(name)
            .map_or(0, |batch| batch.clear())
    }

    /// Names of all batches, sorted
    #[must_use]
    pub fn batch_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.batches.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of requests queued in a batch, `0` if it doesn't exist
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner.batches.get(name).map_or(0, |batch| batch.len())
    }

    /// Number of queued requests per batch
    #[must_use]
    pub fn queue_depths(&self) -> BTreeMap<String, usize> {
        self.inner
            .batches
            .iter()
            .map(|batch| (batch.key().clone(), batch.len()))
            .collect()
    }

    /// Append a request to a batch, creating the batch if needed
    pub fn enqueue(&self, batch: &str, request: PendingRequest) {
        self.inner.batch(batch).push(request);
    }

    /// Append several requests to a batch, keeping their order
    pub fn enqueue_many(&self, batch: &str, requests: impl IntoIterator<Item = PendingRequest>) {
        self.inner.batch(batch).extend(requests);
    }

    /// Append a `GET` request for `url` to a batch, using the engine's
    /// retry policy and timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not an absolute URL with a host.
    pub fn enqueue_url(&self, batch: &str, url: &str) -> Result<()> {
        let mut request = PendingRequest::try_from(url)?.with_retry(self.inner.retry);
        request.timeout = self.inner.timeout;
        self.enqueue(batch, request);
        Ok(())
    }

    /// Run everything currently queued in a batch.
    ///
    /// Requests are started in waves. A wave holds as many requests as the
    /// rate limit allows per window (or `max_concurrency` without rate
    /// limiting) and is admitted as a whole; the next wave is formed once
    /// every member of the current one finished.
    ///
    /// Only successful sends are part of the result. Failed ones are
    /// reported through [`Engine::on_error`] and [`Engine::stats`].
    /// Requests requeued while running stay queued for the next run.
    pub async fn run_batch(&self, name: &str) -> Vec<Response> {
        let Some(batch) = self.inner.batches.get(name).map(|b| Arc::clone(b.value())) else {
            return Vec::new();
        };
        let name: Arc<str> = Arc::from(name);
        let work = batch
            .drain()
            .into_iter()
            .map(|request| (Arc::clone(&name), request))
            .collect();
        self.inner.run(work).await
    }

    /// Run everything currently queued in any batch, as one run.
    ///
    /// See [`Engine::run_batch`].
    pub async fn run_all(&self) -> Vec<Response> {
        let mut work = Vec::new();
        for name in self.batch_names() {
            let Some(batch) = self.inner.batches.get(&name).map(|b| Arc::clone(b.value())) else {
                continue;
            };
            let name: Arc<str> = Arc::from(name);
            work.extend(
                batch
                    .drain()
                    .into_iter()
                    .map(|request| (Arc::clone(&name), request)),
            );
        }
        self.inner.run(work).await
    }

    /// Start draining all batches in the background.
    ///
    /// Returns `false` if the engine is already draining.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut drain = self.inner.lock_drain();
        if drain.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.inner).drain_continuously(token.clone()));
        *drain = Some(ContinuousDrain { token, handle });
        log::info!("Started continuous drain");
        true
    }

    /// Stop the background drain and wait for its in-flight sends.
    pub async fn stop(&self) {
        let drain = self.inner.lock_drain().take();
        let Some(drain) = drain else {
            return;
        };

        drain.token.cancel();
        if let Err(e) = drain.handle.await {
            log::warn!("Continuous drain failed: {e}");
        }
        log::info!("Stopped continuous drain");
    }

    /// Whether the background drain is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .lock_drain()
            .as_ref()
            .is_some_and(|d| !d.handle.is_finished())
    }

    /// Stop the background drain and remove all batches
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.batches.clear();
    }

    /// Send a single request right away, outside of any batch.
    ///
    /// The request is rate limited and counted like queued ones and its
    /// outcome is passed to the callbacks, but requeue predicates don't
    /// apply.
    ///
    /// # Errors
    ///
    /// Returns the error of the logical send.
    pub async fn send(&self, request: PendingRequest) -> Result<Response> {
        if let Err(error) = self
            .inner
            .limiter
            .admit_many_or_cancel(1, &request.cancellation)
            .await
        {
            self.inner.counters.record_error();
            self.inner.observers.error(&request, &error);
            return Err(error);
        }

        let _permit = self.inner.permits.acquire().await.ok();
        self.inner.process(request).await
    }

    /// Call `callback` with every response
    pub fn on_response<F>(&self, callback: F)
    where
        F: Fn(&Response, &PendingRequest) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.inner.observers.on_response(callback);
    }

    /// Call `callback` with every request that failed for good
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&PendingRequest, &ErrorKind) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.inner.observers.on_error(callback);
    }

    /// Call `callback` whenever a request of a drain-once run finished
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&Progress) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.inner.observers.on_progress(callback);
    }

    /// Let `predicate` decide whether a queued request goes back into its
    /// batch after a response.
    ///
    /// Predicates run in registration order; the first one not returning
    /// [`RequeueDecision::Keep`] decides.
    pub fn requeue_on_response<F>(&self, predicate: F)
    where
        F: Fn(&Response, &PendingRequest) -> RequeueDecision + Send + Sync + 'static,
    {
        self.inner.observers.requeue_on_response(predicate);
    }

    /// Let `predicate` decide whether a queued request goes back into its
    /// batch after it failed for good. Cancelled requests are never
    /// requeued.
    pub fn requeue_on_error<F>(&self, predicate: F)
    where
        F: Fn(&PendingRequest, &ErrorKind) -> RequeueDecision + Send + Sync + 'static,
    {
        self.inner.observers.requeue_on_error(predicate);
    }

    /// Register a hook run before every logical send
    pub fn add_request_hook(&self, hook: impl RequestHook + 'static) {
        self.inner.executor.add_request_hook(Arc::new(hook));
    }

    /// Register a hook run on every final response
    pub fn add_response_hook(&self, hook: impl ResponseHook + 'static) {
        self.inner.executor.add_response_hook(Arc::new(hook));
    }

    /// Cumulative counters
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.counters.snapshot()
    }

    /// Reset the cumulative counters
    pub fn reset_stats(&self) {
        self.inner.counters.reset();
    }

    /// Change the rate limit. `0` disables it.
    pub fn set_rate_limit(&self, limit: usize, window: Duration) {
        self.inner.limiter.reconfigure(limit, window);
    }

    /// The shared rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// The proxy rotator, if any
    #[must_use]
    pub fn rotator(&self) -> Option<&ProxyRotator> {
        self.inner.rotator.as_deref()
    }

    /// The transport pool
    #[must_use]
    pub fn transports(&self) -> &TransportPool {
        self.inner.executor.transports()
    }
}

#[derive(Debug)]
struct ContinuousDrain {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct Inner {
    executor: Executor,
    limiter: RateLimiter,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    batches: DashMap<String, Arc<Batch>>,
    rotator: Option<Arc<ProxyRotator>>,
    session: SessionStore,
    observers: Observers,
    counters: Counters,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    idle_interval: Duration,
    drain: Mutex<Option<ContinuousDrain>>,
}

impl Inner {
    fn batch(&self, name: &str) -> Arc<Batch> {
        self.batches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Batch::new(name)))
            .clone()
    }

    fn lock_drain(&self) -> MutexGuard<'_, Option<ContinuousDrain>> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fill in what the request leaves to the engine: timeout, routing
    /// target and session state.
    fn prepare(&self, request: &mut PendingRequest) {
        if request.timeout.is_none() {
            request.timeout = self.timeout;
        }

        if request.target.is_none()
            && let Some(rotator) = &self.rotator
        {
            request.target = rotator.select(request.host().as_deref());
            if request.target.is_none() {
                log::debug!("{request}: no routing target available, sending directly");
            }
        }

        self.session.apply(request);
    }

    /// One logical send plus session bookkeeping, counters and callbacks.
    async fn process(&self, mut request: PendingRequest) -> Result<Response> {
        self.prepare(&mut request);

        let result = self.executor.execute(request.clone()).await;
        match &result {
            Ok(response) => {
                self.session.record(&request, response);
                self.counters.record_success();
                self.observers.response(response, &request);
            }
            Err(error) => {
                log::debug!("{request}: {error}");
                self.counters.record_error();
                self.observers.error(&request, error);
            }
        }
        result
    }

    /// [`Inner::process`] a request taken from `batch`, then apply the
    /// requeue predicates.
    async fn process_queued(&self, batch: &str, request: PendingRequest) -> Result<Response> {
        let original = request.clone();
        let result = self.process(request).await;

        let decision = match &result {
            Ok(response) => self.observers.requeue_response(response, &original),
            Err(ErrorKind::CallerCancelled) => RequeueDecision::Keep,
            Err(error) => self.observers.requeue_error(&original, error),
        };
        match decision {
            RequeueDecision::Keep => {}
            RequeueDecision::Requeue => self.requeue(batch, original),
            RequeueDecision::Replace(replacement) => self.requeue(batch, replacement),
        }

        result
    }

    fn requeue(&self, batch: &str, request: PendingRequest) {
        let Some(target) = self.batches.get(batch).map(|b| Arc::clone(b.value())) else {
            log::warn!("Dropping requeued {request}: batch '{batch}' was removed");
            return;
        };
        log::debug!("Requeueing {request} into '{batch}'");
        target.push(request);
        self.counters.record_requeue();
    }

    fn wave_size(&self, remaining: usize) -> usize {
        let limit = self.limiter.limit();
        let cap = if limit == 0 {
            self.max_concurrency
        } else {
            limit
        };
        cap.min(remaining).max(1)
    }

    /// Run a fixed work list in admitted waves.
    async fn run(self: &Arc<Self>, work: Vec<(Arc<str>, PendingRequest)>) -> Vec<Response> {
        let mut progress: HashMap<Arc<str>, Progress> = HashMap::new();
        for (batch, _) in &work {
            progress
                .entry(Arc::clone(batch))
                .or_insert_with(|| Progress {
                    batch: batch.to_string(),
                    completed: 0,
                    total: 0,
                    errors: 0,
                })
                .total += 1;
        }

        let mut pending = VecDeque::from(work);
        let mut responses = Vec::with_capacity(pending.len());
        log::info!("Running {} requests", pending.len());

        while !pending.is_empty() {
            let size = self.wave_size(pending.len());
            self.limiter.admit_many(size).await;

            let mut wave = FuturesUnordered::new();
            for (batch, request) in pending.drain(..size) {
                let permit = Arc::clone(&self.permits).acquire_owned().await.ok();
                let inner = Arc::clone(self);
                let original = request.clone();
                let task_batch = Arc::clone(&batch);
                let task = tokio::spawn(async move {
                    let _permit = permit;
                    inner.process_queued(&task_batch, request).await
                });
                wave.push(async move { (batch, original, task.await) });
            }

            while let Some((batch, original, joined)) = wave.next().await {
                let result = joined.unwrap_or_else(|e| {
                    let error = ErrorKind::Join(e);
                    log::warn!("{original}: {error}");
                    self.counters.record_error();
                    self.observers.error(&original, &error);
                    Err(error)
                });
                if let Some(progress) = progress.get_mut(&batch) {
                    progress.completed += 1;
                    if result.is_err() {
                        progress.errors += 1;
                    }
                    self.observers.progress(progress);
                }
                if let Ok(response) = result {
                    responses.push(response);
                }
            }
        }

        responses
    }

    /// Pop the head of the first non-empty batch, in name order.
    fn next_queued(&self) -> Option<(Arc<Batch>, PendingRequest)> {
        let mut batches: Vec<_> = self.batches.iter().map(|b| Arc::clone(b.value())).collect();
        batches.sort_by(|a, b| a.name().cmp(b.name()));
        batches.into_iter().find_map(|batch| {
            let request = batch.pop()?;
            Some((batch, request))
        })
    }

    async fn drain_continuously(self: Arc<Self>, token: CancellationToken) {
        let (waiter, guard) = WaitGroup::new();

        while !token.is_cancelled() {
            let Some((batch, request)) = self.next_queued() else {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(self.idle_interval) => {}
                }
                continue;
            };

            let permit = match self.limiter.admit_many_or_cancel(1, &token).await {
                Ok(()) => tokio::select! {
                    () = token.cancelled() => None,
                    permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
                },
                Err(_) => None,
            };
            let Some(permit) = permit else {
                // Stopped while waiting, hand the request back
                batch.push_front(request);
                break;
            };

            let inner = Arc::clone(&self);
            let guard = guard.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let _permit = permit;
                // Failures are reported through the error callbacks
                let _ = inner.process_queued(batch.name(), request).await;
            });
        }

        drop(guard);
        waiter.wait().await;
    }
}
