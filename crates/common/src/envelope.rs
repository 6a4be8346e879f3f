//! Wire envelope model.
//!
//! Every frame on the wire is a JSON object carrying at least a `type` tag.
//! Inbound frames are kept as [`serde_json::Value`] so that application fields
//! the bus does not know about survive forwarding verbatim; only the `type`
//! tag and correlation fields are interpreted. Frames the bus synthesizes
//! itself are the typed [`OutboundFrame`] variants.

use crate::error::EnvelopeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client roles a room accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Privileged client that issues queries; at most one per room.
    Runtime,
    /// Data-plane client that services queries and doc requests.
    Agent,
    /// Client that requests prebuilt UI artifacts from the runtime.
    Prod,
    /// Observer that receives a decorated copy of every routed message.
    Admin,
}

impl Role {
    /// All accepted roles, in the order they are reported to clients.
    pub const ALL: [Role; 4] = [Role::Runtime, Role::Agent, Role::Prod, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Runtime => "runtime",
            Role::Agent => "agent",
            Role::Prod => "prod",
            Role::Admin => "admin",
        }
    }

    /// Parse a role from its query-parameter form.
    pub fn parse(s: &str) -> Result<Role, EnvelopeError> {
        match s {
            "runtime" => Ok(Role::Runtime),
            "agent" => Ok(Role::Agent),
            "prod" => Ok(Role::Prod),
            "admin" => Ok(Role::Admin),
            other => Err(EnvelopeError::InvalidRole(other.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of the reserved `type` values the routing engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Connected,
    GraphqlQuery,
    QueryResponse,
    GetDocs,
    Docs,
    GetProdUi,
    ProdUiResponse,
    CheckAgents,
    AgentStatusResponse,
    Ping,
    Pong,
    Error,
    HistoricalLogs,
    /// Anything else; routed to the log-and-drop handler.
    Unknown,
}

impl MessageKind {
    pub fn from_type(type_name: &str) -> MessageKind {
        match type_name {
            "connected" => MessageKind::Connected,
            "graphql_query" => MessageKind::GraphqlQuery,
            "query_response" => MessageKind::QueryResponse,
            "get_docs" => MessageKind::GetDocs,
            "docs" => MessageKind::Docs,
            "get_prod_ui" => MessageKind::GetProdUi,
            "prod_ui_response" => MessageKind::ProdUiResponse,
            "check_agents" => MessageKind::CheckAgents,
            "agent_status_response" => MessageKind::AgentStatusResponse,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "error" => MessageKind::Error,
            "historical_logs" => MessageKind::HistoricalLogs,
            _ => MessageKind::Unknown,
        }
    }

    /// Request/response kinds must carry a `requestId` for correlation.
    pub fn requires_request_id(&self) -> bool {
        matches!(
            self,
            MessageKind::GraphqlQuery
                | MessageKind::QueryResponse
                | MessageKind::GetDocs
                | MessageKind::Docs
        )
    }
}

/// A decoded inbound envelope.
///
/// Holds the raw JSON object so forwarding preserves every field the sender
/// put on the wire, alongside the classified `type` tag.
#[derive(Debug, Clone)]
pub struct Envelope {
    value: Value,
    type_name: String,
    kind: MessageKind,
}

impl Envelope {
    /// Decode and validate a UTF-8 frame.
    ///
    /// Requires a JSON object with a string `type`; request/response kinds
    /// additionally require a `requestId`.
    pub fn parse(text: &str) -> Result<Envelope, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(EnvelopeError::NotObject);
        }
        let type_name = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?
            .to_string();
        let kind = MessageKind::from_type(&type_name);

        let envelope = Envelope {
            value,
            type_name,
            kind,
        };
        if kind.requires_request_id() && envelope.request_id().is_none() {
            return Err(EnvelopeError::MissingRequestId(envelope.type_name.clone()));
        }
        Ok(envelope)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn request_id(&self) -> Option<&str> {
        self.str_field("requestId")
    }

    /// A top-level string field, if present.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.value.get(name).and_then(Value::as_str)
    }

    /// Copy of the envelope with one extra top-level field.
    pub fn annotated(&self, key: &str, field: Value) -> Value {
        let mut out = self.value.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.insert(key.to_string(), field);
        }
        out
    }

    /// Copy of the envelope with several extra top-level fields.
    pub fn annotated_with(&self, fields: Map<String, Value>) -> Value {
        let mut out = self.value.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.extend(fields);
        }
        out
    }

    /// Serialized wire form of the (unmodified) envelope.
    pub fn to_text(&self) -> String {
        self.value.to_string()
    }
}

/// An OPEN agent as reported by `agent_status_response`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub connected_at: i64,
    pub project_id: String,
}

/// Frames the bus synthesizes itself.
///
/// Everything the bus merely forwards stays a raw [`Value`]; these are the
/// envelopes it originates, each carrying `type` and `timestamp`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Greeting sent right after a successful upgrade.
    #[serde(rename_all = "camelCase")]
    Connected {
        client_id: String,
        client_type: Role,
        project_id: String,
        message: String,
        timestamp: i64,
    },
    /// Reply to `ping`, sender only.
    #[serde(rename_all = "camelCase")]
    Pong { timestamp: i64 },
    /// Error envelope per the wire contract.
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        project_id: String,
        timestamp: i64,
    },
    /// Synchronous reply to `check_agents`.
    #[serde(rename_all = "camelCase")]
    AgentStatusResponse {
        agents: Vec<AgentInfo>,
        timestamp: i64,
    },
    /// One-shot history replay delivered to a newly connected admin.
    #[serde(rename_all = "camelCase")]
    HistoricalLogs {
        logs: Vec<Value>,
        count: usize,
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_round_trip() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
        assert!(Role::parse("observer").is_err());
        let err = Role::parse("Runtime").unwrap_err();
        assert!(err.to_string().contains("runtime, agent, prod, admin"));
    }

    #[test]
    fn test_parse_requires_object_and_type() {
        assert!(matches!(
            Envelope::parse("[1,2]"),
            Err(EnvelopeError::NotObject)
        ));
        assert!(matches!(
            Envelope::parse(r#"{"timestamp":1}"#),
            Err(EnvelopeError::MissingType)
        ));
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_parse_request_id_rule() {
        let err = Envelope::parse(r#"{"type":"graphql_query","timestamp":1}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingRequestId(_)));

        let env =
            Envelope::parse(r#"{"type":"graphql_query","requestId":"q1","timestamp":1}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::GraphqlQuery);
        assert_eq!(env.request_id(), Some("q1"));

        // Non-correlated kinds don't need a requestId.
        let env = Envelope::parse(r#"{"type":"ping","timestamp":1}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::Ping);
        assert_eq!(env.request_id(), None);
    }

    #[test]
    fn test_unknown_kind() {
        let env = Envelope::parse(r#"{"type":"telemetry_blob","timestamp":1}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::Unknown);
        assert_eq!(env.type_name(), "telemetry_blob");
    }

    #[test]
    fn test_annotated_preserves_unknown_fields() {
        let env = Envelope::parse(
            r#"{"type":"graphql_query","requestId":"q1","query":"{ ping }","customField":{"a":1},"timestamp":1000}"#,
        )
        .unwrap();
        let out = env.annotated("runtimeId", json!("r0"));
        assert_eq!(out["runtimeId"], "r0");
        assert_eq!(out["customField"]["a"], 1);
        assert_eq!(out["query"], "{ ping }");
        // The original is untouched.
        assert!(env.value().get("runtimeId").is_none());
    }

    #[test]
    fn test_outbound_frame_wire_shape() {
        let frame = OutboundFrame::Error {
            message: "timeout after 30000ms".to_string(),
            request_id: Some("q1".to_string()),
            project_id: "P".to_string(),
            timestamp: 31_000,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["requestId"], "q1");
        assert_eq!(value["projectId"], "P");
        assert_eq!(value["timestamp"], 31_000);

        let frame = OutboundFrame::Connected {
            client_id: "c1".to_string(),
            client_type: Role::Runtime,
            project_id: "P".to_string(),
            message: "connected".to_string(),
            timestamp: 1,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["clientType"], "runtime");
    }

    #[test]
    fn test_error_frame_omits_absent_request_id() {
        let frame = OutboundFrame::Error {
            message: "bad JSON".to_string(),
            request_id: None,
            project_id: "P".to_string(),
            timestamp: 1,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("requestId").is_none());
    }
}
