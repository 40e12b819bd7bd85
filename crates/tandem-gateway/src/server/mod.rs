//! Gateway server: configuration, the request lifecycle and the axum
//! surface in front of it.

pub mod config;
pub mod handler;
pub mod http;
