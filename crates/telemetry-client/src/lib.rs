//! Public entry point for the Beacon delivery pipeline.
//!
//! [`TelemetryClient::start`] wires the pieces together: DSN-derived HTTP
//! transport behind the rate limiter, wrapped in the disk-backed caching
//! decorator, fed by the background delivery worker. The client is an
//! explicit handle; construct as many as you need and drop them
//! independently, there is no process-global instance.

mod client;
mod options;

pub use client::{ClientError, ClientResult, TelemetryClient};
pub use options::{ClientOptions, Dsn};
