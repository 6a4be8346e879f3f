//! Envelope error types.

use thiserror::Error;

/// Errors raised while decoding or validating a wire envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Frame was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame was valid JSON but not an object.
    #[error("envelope must be a JSON object")]
    NotObject,

    /// Envelope is missing the `type` field.
    #[error("envelope missing required field 'type'")]
    MissingType,

    /// A request/response envelope is missing its `requestId`.
    #[error("'{0}' envelope missing required field 'requestId'")]
    MissingRequestId(String),

    /// Client role string was not one of the accepted roles.
    #[error("invalid client type '{0}', must be one of: runtime, agent, prod, admin")]
    InvalidRole(String),
}
