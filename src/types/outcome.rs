use crate::{ErrorKind, Response};

/// Result of a single try of the execution pipeline.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// A response was received and buffered
    Success(Response),
    /// The try failed and the retry policy allows another one
    RetryableFailure {
        /// The classified error of this try
        error: ErrorKind,
        /// Zero-based index of the try that failed
        attempt: u32,
    },
    /// The try failed and must not be retried
    TerminalFailure(ErrorKind),
}

impl ExecutionOutcome {
    /// Whether this outcome carries a response
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}
