//! gRPC service implementation.
//!
//! - [`handler`] - the `WorkerService` entry point ([`handler::Worker`]).

pub mod handler;
