//! Random identifiers: auth tokens and request ids.
//!
//! Both are UUID v4 strings, the format existing EA and client deployments
//! already store in their configuration.

use uuid::Uuid;

/// Generate a fresh authentication token.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a request id for a command submitted without one.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}
