//! margin-sweep: moves confirmed spot deposits into the margin account.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod exchange;
pub mod retry;
pub mod rate_limit;
pub mod notify;
pub mod engine;
