//! Wire protocol between the gateway and the worker.
//!
//! The messages are plain protobuf messages declared with `prost` derives.
//! The service plumbing (`worker_service_client` and `worker_service_server`)
//! is generated at build time for the `tandem.worker.v1.WorkerService`
//! service with a single unary method:
//!
//! ```text
//! rpc DoWork(WorkRequest) returns (WorkResponse);
//! ```
//!
//! Cancellation is never a message in this protocol. The caller's deadline
//! travels in the standard `grpc-timeout` header and an abandoned call is
//! signalled by the transport (`RST_STREAM` or a closed connection).

/// A unit of work submitted by the gateway.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct WorkRequest {
    /// Correlation id of the originating external request.
    #[prost(string, tag = "1")]
    pub task_id: String,
    /// Opaque payload recorded by the worker's provisional record.
    #[prost(string, tag = "2")]
    pub data: String,
}

/// Reply sent once the worker has committed its side of the request.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct WorkResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

include!(concat!(env!("OUT_DIR"), "/tandem.worker.v1.WorkerService.rs"));
