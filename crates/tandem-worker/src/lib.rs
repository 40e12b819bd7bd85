//! gRPC worker library: exposes the server so the binary and in-process
//! integration tests share one bootstrap.

pub mod server;
