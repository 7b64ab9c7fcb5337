//! CYCLER — unattended perp position cycling with crash-safe reconciliation.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod engine;
pub mod gateway;
pub mod types;
