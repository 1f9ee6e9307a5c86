//! Application layer
//!
//! - Instance: builds router, outbounds and inbounds from the config and
//!   runs them
//! - metrics: process-wide Prometheus counters
//! - metrics_api: optional `/metrics` HTTP endpoint

mod instance;
pub mod metrics;
pub mod metrics_api;

pub use instance::Instance;
