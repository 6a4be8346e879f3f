//! Common types and wire protocol for the message bus.
//!
//! Defines the JSON envelope exchanged on every WebSocket frame, the client
//! roles a room accepts, and the timestamp/bucket-key derivation shared by
//! the routing and storage layers.

pub mod envelope;
pub mod error;
pub mod time;

pub use envelope::{AgentInfo, Envelope, MessageKind, OutboundFrame, Role};
pub use error::EnvelopeError;
pub use time::{day_key, hour_key, now_millis, recent_hour_keys};

/// Validate a project identifier.
///
/// Project ids are opaque tenant ids matching `[A-Za-z0-9_-]{1,64}`.
pub fn valid_project_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_project_id() {
        assert!(valid_project_id("demo"));
        assert!(valid_project_id("proj-x_42"));
        assert!(valid_project_id(&"a".repeat(64)));
        assert!(!valid_project_id(""));
        assert!(!valid_project_id(&"a".repeat(65)));
        assert!(!valid_project_id("has space"));
        assert!(!valid_project_id("dot.dot"));
        assert!(!valid_project_id("sneaky/../path"));
    }
}
