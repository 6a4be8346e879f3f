//! Gateway error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire envelope decode/validation error.
    #[error(transparent)]
    Envelope(#[from] common::EnvelopeError),

    /// Durable store error.
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// API key store error.
    #[error(transparent)]
    KeyStore(#[from] keystore::KeyStoreError),

    /// The project's room task is gone.
    #[error("room for project '{0}' is not available")]
    RoomUnavailable(String),
}

impl GatewayError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::Json(_) => (StatusCode::BAD_REQUEST, "invalid_json"),
            GatewayError::Envelope(common::EnvelopeError::InvalidRole(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_client_type")
            }
            GatewayError::Envelope(_) => (StatusCode::BAD_REQUEST, "invalid_envelope"),
            GatewayError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            GatewayError::KeyStore(keystore::KeyStoreError::ActiveKeyExists(_)) => {
                (StatusCode::CONFLICT, "key_exists")
            }
            GatewayError::KeyStore(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            GatewayError::RoomUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "room_unavailable")
            }
        }
    }
}

/// Errors surface as JSON `{error, message}` bodies with a matching status.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = GatewayError::KeyStore(keystore::KeyStoreError::ActiveKeyExists("p".into()));
        assert_eq!(err.status_and_code().0, StatusCode::CONFLICT);

        let err = GatewayError::Envelope(common::EnvelopeError::InvalidRole("x".into()));
        assert_eq!(err.status_and_code().0, StatusCode::BAD_REQUEST);

        let err = GatewayError::RoomUnavailable("p".into());
        assert_eq!(err.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
