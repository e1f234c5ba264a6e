#![allow(unreachable_pub)]

mod error;
mod outcome;
mod request;
mod response;

pub use error::{BoxError, ErrorKind, FailureCategory};
pub use outcome::ExecutionOutcome;
pub use request::{HttpVersion, PendingRequest};
pub use response::Response;

#[cfg(test)]
pub(crate) use response::response_with_status;

/// The volley `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
