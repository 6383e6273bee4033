//! Tracing setup for the Aiolos gateway: config, subscriber init and span macros.

pub mod config;
pub mod spans;
pub mod subscriber;

pub use config::{LogFormat, OtlpProtocol, TracingConfig};
pub use subscriber::{init_tracing, TracingGuard};
