//! Error types shared by the gateway and the worker.
//!
//! [`Error`] captures every failure that can end a request. It implements
//! `From<Error>` for `tonic::Status` so the worker can report each failure
//! with a distinct status code, and [`Error::from_status`] maps a worker reply
//! back so the gateway's rollback decision never depends on parsing an error
//! string.
//!
//! ## Error Cases
//! - `Transaction`: the store refused to begin or insert. No downstream call
//!   is made.
//! - `Commit`: the store refused a commit after the work succeeded.
//! - `RequestCancelled`: the originating caller cancelled or went away.
//! - `DeadlineExceeded`: the end-to-end deadline passed first.
//! - `Transport`: the downstream service was unreachable or the connection
//!   was severed.
//! - `Internal`: any other downstream failure.
//! - `InvalidRequest`: the request was malformed.

use crate::signal::CancelCause;
use crate::store::StoreError;
use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for both services.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The store refused to open a transaction or to record the provisional
    /// entry.
    #[error("Transaction error: {0}")]
    Transaction(StoreError),

    /// The store refused to commit after the work completed.
    #[error("Commit error: {0}")]
    Commit(StoreError),

    /// The originating caller cancelled the request.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The end-to-end deadline elapsed before the work completed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The downstream service could not be reached or the connection broke.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// Any other downstream or internal failure.
    #[error("Internal error: {context}")]
    Internal { context: String },

    /// The request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl Error {
    /// Classifies a status returned by the worker.
    pub fn from_status(status: &Status) -> Self {
        match status.code() {
            Code::Cancelled => Error::RequestCancelled,
            Code::DeadlineExceeded => Error::DeadlineExceeded,
            // tonic reports connection failures as `Unavailable` and broken
            // HTTP/2 streams as `Unknown`.
            Code::Unavailable | Code::Unknown => Error::Transport {
                context: status.message().to_string(),
            },
            Code::InvalidArgument => Error::InvalidRequest {
                reason: status.message().to_string(),
            },
            _ => Error::Internal {
                context: format!("{:?}: {}", status.code(), status.message()),
            },
        }
    }
}

impl From<CancelCause> for Error {
    fn from(cause: CancelCause) -> Self {
        match cause {
            CancelCause::Cancelled => Error::RequestCancelled,
            CancelCause::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Transaction(e) => Status::internal(format!("Transaction error: {e}")),
            Error::Commit(e) => Status::internal(format!("Commit error: {e}")),
            Error::RequestCancelled => Status::cancelled("Work cancelled"),
            Error::DeadlineExceeded => Status::deadline_exceeded("Work deadline exceeded"),
            Error::Transport { context } => Status::unavailable(context),
            Error::Internal { context } => Status::internal(context),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
        }
    }
}
