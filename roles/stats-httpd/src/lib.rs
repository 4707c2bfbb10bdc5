//! HTTP statistics service over a mining share log.
//!
//! Consumes the share event stream, keeps sliding-window hashrate statistics
//! per worker, per user, and pool-wide, and serves them as JSON.

pub mod api;
pub mod config;
pub mod ingest;
pub mod server;
pub mod source;
