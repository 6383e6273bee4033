//! Outbound side: request correlation and forwarding to the telemetry backend.

pub mod correlation;
pub mod forward;

pub use forward::{Forward, HttpForwarder};
