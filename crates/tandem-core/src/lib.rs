#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

pub mod events;
pub mod proto;
pub mod signal;
pub mod store;
pub mod telemetry;
pub mod txn;
