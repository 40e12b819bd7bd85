//! HTTP gateway library: the binary and the end-to-end tests share one
//! bootstrap.

pub mod server;
