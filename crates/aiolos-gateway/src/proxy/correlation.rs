//! Request ID generation for tracing a device request through to the backend.

use uuid::Uuid;

/// Header carrying the gateway's request ID on backend calls.
pub const REQUEST_ID_HEADER: &str = "x-aiolos-request-id";

/// Generate a new request ID (UUID v4).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
