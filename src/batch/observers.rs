use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::{BoxError, ErrorKind, PendingRequest, Response};

/// Progress of a drain-once run over one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Name of the batch
    pub batch: String,
    /// Requests of this batch finished so far in this run
    pub completed: usize,
    /// Requests of this batch taken into this run
    pub total: usize,
    /// Finished requests which failed
    pub errors: usize,
}

/// What to do with a request after its logical send finished
#[derive(Debug, Default)]
pub enum RequeueDecision {
    /// Leave it be
    #[default]
    Keep,
    /// Append it to the tail of its batch again
    Requeue,
    /// Append the given replacement to the tail of the batch instead
    Replace(PendingRequest),
}

type ResponseCallback = Arc<dyn Fn(&Response, &PendingRequest) -> Result<(), BoxError> + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&PendingRequest, &ErrorKind) -> Result<(), BoxError> + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(&Progress) -> Result<(), BoxError> + Send + Sync>;
type ResponsePredicate = Arc<dyn Fn(&Response, &PendingRequest) -> RequeueDecision + Send + Sync>;
type ErrorPredicate = Arc<dyn Fn(&PendingRequest, &ErrorKind) -> RequeueDecision + Send + Sync>;

/// Run one observer, logging instead of propagating its failure.
///
/// Both returned errors and panics are caught, so a broken observer can
/// neither abort the send that triggered it nor keep later observers from
/// running.
fn dispatch<T>(what: &str, observer: impl FnOnce() -> Result<T, BoxError>) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(observer)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::warn!("{what} failed: {e}");
            None
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::warn!("{what} panicked: {message}");
            None
        }
    }
}

struct Registry<T>(RwLock<Vec<T>>);

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self(RwLock::new(Vec::new()))
    }
}

impl<T: Clone> Registry<T> {
    fn push(&self, value: T) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    fn snapshot(&self) -> Vec<T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Registered callbacks and requeue predicates of an engine
#[derive(Default)]
pub(crate) struct Observers {
    responses: Registry<ResponseCallback>,
    errors: Registry<ErrorCallback>,
    progress: Registry<ProgressCallback>,
    requeue_on_response: Registry<ResponsePredicate>,
    requeue_on_error: Registry<ErrorPredicate>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("responses", &self.responses.len())
            .field("errors", &self.errors.len())
            .field("progress", &self.progress.len())
            .field("requeue_on_response", &self.requeue_on_response.len())
            .field("requeue_on_error", &self.requeue_on_error.len())
            .finish()
    }
}

impl Observers {
    pub(crate) fn on_response<F>(&self, callback: F)
    where
        F: Fn(&Response, &PendingRequest) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.responses.push(Arc::new(callback));
    }

    pub(crate) fn on_error<F>(&self, callback: F)
    where
        F: Fn(&PendingRequest, &ErrorKind) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.errors.push(Arc::new(callback));
    }

    pub(crate) fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&Progress) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.progress.push(Arc::new(callback));
    }

    pub(crate) fn requeue_on_response<F>(&self, predicate: F)
    where
        F: Fn(&Response, &PendingRequest) -> RequeueDecision + Send + Sync + 'static,
    {
        self.requeue_on_response.push(Arc::new(predicate));
    }

    pub(crate) fn requeue_on_error<F>(&self, predicate: F)
    where
        F: Fn(&PendingRequest, &ErrorKind) -> RequeueDecision + Send + Sync + 'static,
    {
        self.requeue_on_error.push(Arc::new(predicate));
    }

    pub(crate) fn response(&self, response: &Response, request: &PendingRequest) {
        for callback in self.responses.snapshot() {
            dispatch("Response callback", || callback(response, request));
        }
    }

    pub(crate) fn error(&self, request: &PendingRequest, error: &ErrorKind) {
        for callback in self.errors.snapshot() {
            dispatch("Error callback", || callback(request, error));
        }
    }

    pub(crate) fn progress(&self, progress: &Progress) {
        for callback in self.progress.snapshot() {
            dispatch("Progress callback", || callback(progress));
        }
    }

    /// First non-`Keep` decision of the response predicates
    pub(crate) fn requeue_response(
        &self,
        response: &Response,
        request: &PendingRequest,
    ) -> RequeueDecision {
        self.requeue_on_response
            .snapshot()
            .iter()
            .filter_map(|predicate| {
                dispatch("Requeue predicate", || Ok(predicate(response, request)))
            })
            .find(|decision| !matches!(decision, RequeueDecision::Keep))
            .unwrap_or_default()
    }

    /// First non-`Keep` decision of the error predicates
    pub(crate) fn requeue_error(&self, request: &PendingRequest, error: &ErrorKind) -> RequeueDecision {
        self.requeue_on_error
            .snapshot()
            .iter()
            .filter_map(|predicate| dispatch("Requeue predicate", || Ok(predicate(request, error))))
            .find(|decision| !matches!(decision, RequeueDecision::Keep))
            .unwrap_or_default()
    }
}
