//! Front router: the stateless per-request entry point.
//!
//! Endpoints:
//! - `GET /health` - worker liveness, or room liveness with `?projectId=`
//! - `GET /websocket?projectId=&type=&apiKey?=` - upgrade into a room
//! - `GET /status?projectId=` - room snapshot
//! - `GET /usage?projectId=` - usage report
//! - `POST/GET /api-keys`, `GET/DELETE /api-keys/{projectId}` - key CRUD
//!
//! Requests that name a project resolve to its room through the registry
//! (same id, same room). API keys are validated when presented, except for
//! projects on the configured bypass list. The `/api-keys` surface sits
//! behind a bearer service-key check when one is configured.

use crate::config::Config;
use crate::connection::{serve_socket, ConnectionMetadata};
use crate::error::GatewayError;
use crate::room::AdmissionDecision;
use crate::rooms::Rooms;
use axum::{
    extract::{
        ws::rejection::WebSocketUpgradeRejection, Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{now_millis, valid_project_id, Role};
use keystore::KeyStore;
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::RoomStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Shared application state.
pub struct AppState {
    pub rooms: Rooms,
    pub store: Arc<dyn RoomStore>,
    pub keys: KeyStore,
    pub config: Config,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/websocket", get(websocket_handler))
        .route("/status", get(status_handler))
        .route("/usage", get(usage_handler))
        .route("/api-keys", post(create_key_handler).get(list_keys_handler))
        .route(
            "/api-keys/{project_id}",
            get(describe_key_handler).delete(revoke_key_handler),
        )
        .with_state(state)
        .layer(cors_layer())
}

/// CORS policy: any origin, the standard verb set, and the headers a
/// browser WebSocket client sends, cached for a day.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
            header::ACCEPT,
            header::ORIGIN,
            header::UPGRADE,
            header::CONNECTION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("sec-websocket-key"),
            HeaderName::from_static("sec-websocket-version"),
            HeaderName::from_static("sec-websocket-protocol"),
            HeaderName::from_static("sec-websocket-extensions"),
        ])
        .max_age(Duration::from_secs(86_400))
}

fn error_json(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"error": code, "message": message.into()})),
    )
        .into_response()
}

/// Extract and validate the `projectId` query parameter.
fn require_project(params: &HashMap<String, String>) -> Result<String, Response> {
    let Some(project_id) = params.get("projectId") else {
        return Err(error_json(
            StatusCode::BAD_REQUEST,
            "missing_project_id",
            "projectId query parameter is required",
        ));
    };
    if !valid_project_id(project_id) {
        return Err(error_json(
            StatusCode::BAD_REQUEST,
            "invalid_project_id",
            "projectId must match [A-Za-z0-9_-]{1,64}",
        ));
    }
    Ok(project_id.clone())
}

/// Validate a presented API key unless the project is on the bypass list.
/// Keys arrive via the `apiKey` query parameter or the `x-api-key` header.
async fn check_api_key(
    state: &AppState,
    project_id: &str,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<(), Response> {
    if state.config.bypass_projects.contains(project_id) {
        return Ok(());
    }
    let presented = params.get("apiKey").cloned().or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let Some(key) = presented else {
        return Ok(());
    };

    match state.keys.validate_key(project_id, &key).await {
        Ok(true) => {
            counter!("bus_key_validations_total", "outcome" => "valid").increment(1);
            Ok(())
        }
        Ok(false) => {
            counter!("bus_key_validations_total", "outcome" => "invalid").increment(1);
            Err(error_json(
                StatusCode::FORBIDDEN,
                "invalid_api_key",
                "API key is not valid for this project",
            ))
        }
        Err(e) => {
            error!("Key validation failed for {}: {}", project_id, e);
            Err(GatewayError::from(e).into_response())
        }
    }
}

/// Bearer check for the `/api-keys` surface; open when no key is configured.
fn check_service_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.config.service_key else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_json(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "valid service key required",
        ))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Worker liveness, or room liveness when a project is named.
async fn health_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if params.get("projectId").is_none() {
        return Json(json!({"status": "healthy", "timestamp": now_millis()})).into_response();
    }
    let project_id = match require_project(&params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_api_key(&state, &project_id, &params, &headers).await {
        return resp;
    }
    let room = state.rooms.resolve(&project_id);
    match room.health().await {
        Some(health) => Json(health).into_response(),
        None => GatewayError::RoomUnavailable(project_id).into_response(),
    }
}

/// WebSocket upgrade into the project's room.
async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let project_id = match require_project(&params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_api_key(&state, &project_id, &params, &headers).await {
        return resp;
    }

    let Ok(ws) = ws else {
        return error_json(
            StatusCode::UPGRADE_REQUIRED,
            "upgrade_required",
            "this endpoint requires an 'Upgrade: websocket' request",
        );
    };

    let role = match Role::parse(params.get("type").map(String::as_str).unwrap_or("")) {
        Ok(role) => role,
        Err(e) => return GatewayError::from(e).into_response(),
    };

    let mut room = state.rooms.resolve(&project_id);
    if room.project_id() != project_id {
        // Registry invariant; tripping it means a routing bug, not bad input.
        return error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            "misroute",
            "request reached a room for a different project",
        );
    }

    let decision = match room.admission(role).await {
        Some(decision) => decision,
        None => {
            // The room exited between resolve and the check; take a fresh one.
            room = state.rooms.resolve(&project_id);
            match room.admission(role).await {
                Some(decision) => decision,
                None => return GatewayError::RoomUnavailable(project_id).into_response(),
            }
        }
    };
    if decision == AdmissionDecision::RuntimeConflict {
        counter!("bus_runtime_conflicts_total").increment(1);
        return error_json(
            StatusCode::CONFLICT,
            "runtime_conflict",
            "a runtime is already connected for this project",
        );
    }

    let metadata = ConnectionMetadata {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        origin: headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    };

    info!("Upgrading {} client for {}", role, project_id);
    ws.on_upgrade(move |socket| serve_socket(socket, room, role, metadata))
}

/// Room snapshot.
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let project_id = match require_project(&params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_api_key(&state, &project_id, &params, &headers).await {
        return resp;
    }
    let room = state.rooms.resolve(&project_id);
    match room.status().await {
        Some(status) => Json(status).into_response(),
        None => GatewayError::RoomUnavailable(project_id).into_response(),
    }
}

/// Usage report straight from the durable store.
async fn usage_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let project_id = match require_project(&params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.store.usage_report(&project_id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!("Usage report failed for {}: {}", project_id, e);
            GatewayError::from(e).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyRequest {
    project_id: String,
    description: Option<String>,
    created_by: Option<String>,
}

/// Issue a key. The plaintext appears in this response and nowhere else.
async fn create_key_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyRequest>,
) -> Response {
    if let Err(resp) = check_service_key(&state, &headers) {
        return resp;
    }
    if !valid_project_id(&body.project_id) {
        return error_json(
            StatusCode::BAD_REQUEST,
            "invalid_project_id",
            "projectId must match [A-Za-z0-9_-]{1,64}",
        );
    }

    match state
        .keys
        .create_key(
            &body.project_id,
            body.created_by.as_deref(),
            body.description.as_deref(),
        )
        .await
    {
        Ok(issued) => {
            info!("Issued API key for {}", body.project_id);
            let mut value = match serde_json::to_value(&issued) {
                Ok(v) => v,
                Err(e) => return GatewayError::from(e).into_response(),
            };
            value["message"] =
                json!("Store this key securely; it will not be shown again");
            Json(value).into_response()
        }
        Err(e) => GatewayError::from(e).into_response(),
    }
}

/// List active keys.
async fn list_keys_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_service_key(&state, &headers) {
        return resp;
    }
    match state.keys.list_active().await {
        Ok(keys) => {
            let count = keys.len();
            Json(json!({"keys": keys, "count": count})).into_response()
        }
        Err(e) => GatewayError::from(e).into_response(),
    }
}

/// Describe a project's active key.
async fn describe_key_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_service_key(&state, &headers) {
        return resp;
    }
    match state.keys.describe(&project_id).await {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => error_json(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no active API key for '{project_id}'"),
        ),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

/// Revoke a project's active key.
async fn revoke_key_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_service_key(&state, &headers) {
        return resp;
    }
    match state.keys.revoke(&project_id).await {
        Ok(true) => {
            info!("Revoked API key for {}", project_id);
            Json(json!({"projectId": project_id, "revoked": true})).into_response()
        }
        Ok(false) => error_json(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no active API key for '{project_id}'"),
        ),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_project() {
        let mut params = HashMap::new();
        assert!(require_project(&params).is_err());

        params.insert("projectId".to_string(), "not valid!".to_string());
        assert!(require_project(&params).is_err());

        params.insert("projectId".to_string(), "proj-x".to_string());
        assert_eq!(require_project(&params).unwrap(), "proj-x");
    }
}
