//! Core of the Telegram forwarder: routing rules, per-destination pacing and
//! flood-wait backoff, the history ledger and statistics.
//!
//! This crate is intentionally framework-agnostic. Telegram lives behind the
//! `Transport` port, implemented in the adapter crate.

pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod formatting;
pub mod ledger;
pub mod logging;
pub mod ports;
pub mod rate_limit;
pub mod routing;
pub mod stats;
pub mod store;
pub mod sweep;
pub mod transform;
pub mod utils;

#[cfg(test)]
mod testkit;

pub use errors::{Error, Result};
