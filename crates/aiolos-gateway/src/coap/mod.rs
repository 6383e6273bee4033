//! CoAP (RFC 7252) message codec.
//!
//! Only the subset a telemetry gateway needs: the fixed header, tokens,
//! delta-encoded options and the payload. Block-wise transfer, observe and
//! DTLS are not supported.

pub mod message;

pub use message::{Code, Message, MessageType};

/// Uri-Path option number.
pub const OPTION_URI_PATH: u16 = 11;
/// Content-Format option number.
pub const OPTION_CONTENT_FORMAT: u16 = 12;

/// Recommended upper bound for a CoAP message when the path MTU is unknown.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1152;
