//! Message routing engine.
//!
//! The dispatch table over the envelope `type` tag. Queries from the runtime
//! are forwarded to the first OPEN agent with the issuing runtime annotated;
//! replies correlate back through the pending table; prod UI requests hop
//! through the runtime. Unknown types and inbound `error` envelopes are
//! logged and dropped, never echoed.

use crate::fixtures;
use crate::room::{PendingKind, Room};
use common::{now_millis, AgentInfo, Envelope, MessageKind, OutboundFrame};
use metrics::counter;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

/// Route one parsed inbound envelope.
pub(crate) fn dispatch(room: &mut Room, sender_id: Uuid, envelope: &Envelope) {
    match envelope.kind() {
        MessageKind::GraphqlQuery => forward_request(room, sender_id, envelope, PendingKind::Query),
        MessageKind::GetDocs => forward_request(room, sender_id, envelope, PendingKind::Docs),
        MessageKind::QueryResponse | MessageKind::Docs => forward_reply(room, sender_id, envelope),
        MessageKind::GetProdUi => forward_prod_request(room, sender_id, envelope),
        MessageKind::ProdUiResponse => forward_prod_reply(room, sender_id, envelope),
        MessageKind::CheckAgents => report_agents(room, sender_id),
        MessageKind::Ping => {
            room.send_frame_to(
                sender_id,
                &OutboundFrame::Pong {
                    timestamp: now_millis(),
                },
            );
        }
        MessageKind::Error => {
            // Loop guard: an inbound error is never answered with an error.
            warn!(
                "Client {} in {} reported an error: {}",
                sender_id,
                room.project_id,
                envelope.str_field("message").unwrap_or("<no message>")
            );
        }
        _ => {
            warn!(
                "Dropping unroutable '{}' from {} in {}",
                envelope.type_name(),
                sender_id,
                room.project_id
            );
        }
    }
}

/// `graphql_query` / `get_docs`: runtime -> one OPEN agent, or fallback.
fn forward_request(room: &mut Room, sender_id: Uuid, envelope: &Envelope, kind: PendingKind) {
    if room.runtime.as_ref().map(|r| r.id) != Some(sender_id) {
        room.send_error_to(
            sender_id,
            format!("only the runtime may send '{}'", envelope.type_name()),
            envelope.request_id().map(String::from),
        );
        return;
    }
    // Presence is enforced at parse time for request kinds.
    let Some(request_id) = envelope.request_id().map(String::from) else {
        return;
    };

    evict_stale_agents(room);
    let target = room
        .agents
        .values()
        .find(|a| a.is_open())
        .map(|a| a.id);

    let Some(agent_id) = target else {
        synthesize_or_error(room, sender_id, envelope, kind, &request_id);
        return;
    };

    room.insert_pending(request_id.clone(), sender_id, kind);
    let annotated = envelope.annotated("runtimeId", json!(sender_id.to_string()));
    if room.send_text_to(agent_id, annotated.to_string()) {
        counter!("bus_requests_forwarded_total").increment(1);
        debug!(
            "Forwarded {} {} to agent {} in {}",
            envelope.type_name(),
            request_id,
            agent_id,
            room.project_id
        );
    } else {
        // The agent went stale between the open check and the send.
        room.agents.remove(&agent_id);
        room.remove_pending(&request_id);
        synthesize_or_error(room, sender_id, envelope, kind, &request_id);
    }
}

/// No OPEN agent: synthesize a fixture response, or error when disabled.
fn synthesize_or_error(
    room: &Room,
    runtime_id: Uuid,
    envelope: &Envelope,
    kind: PendingKind,
    request_id: &str,
) {
    if !room.settings.fallback_fixtures {
        room.send_error_to(
            runtime_id,
            "no agent available".to_string(),
            Some(request_id.to_string()),
        );
        return;
    }

    counter!("bus_fallback_responses_total").increment(1);
    let (type_name, data) = match kind {
        PendingKind::Query => (
            "query_response",
            fixtures::query_fixture(envelope.str_field("query").unwrap_or("")),
        ),
        PendingKind::Docs => ("docs", fixtures::docs_fixture()),
    };
    let frame = json!({
        "type": type_name,
        "requestId": request_id,
        "projectId": room.project_id,
        "data": data,
        "timestamp": now_millis(),
    });
    room.send_text_to(runtime_id, frame.to_string());
}

/// `query_response` / `docs`: agent -> the runtime that issued the request.
fn forward_reply(room: &mut Room, sender_id: Uuid, envelope: &Envelope) {
    if !room.agents.contains_key(&sender_id) {
        room.send_error_to(
            sender_id,
            format!("only agents may send '{}'", envelope.type_name()),
            envelope.request_id().map(String::from),
        );
        return;
    }
    let Some(request_id) = envelope.request_id() else {
        return;
    };

    let Some(pending) = room.remove_pending(request_id) else {
        // Duplicate reply, or the request already timed out.
        debug!(
            "Dropping uncorrelated reply {} in {}",
            request_id, room.project_id
        );
        return;
    };

    match &room.runtime {
        Some(runtime) if runtime.id == pending.runtime_id && runtime.is_open() => {
            runtime.send_text(envelope.to_text());
            counter!("bus_replies_delivered_total").increment(1);
        }
        _ => {
            // The issuing runtime is gone or was replaced; the reply refers
            // to a stale runtime id and must not reach the new one.
            debug!(
                "Dropping reply {} for stale runtime {} in {}",
                request_id, pending.runtime_id, room.project_id
            );
        }
    }
}

/// `get_prod_ui`: prod -> runtime, annotated with the requesting prod.
fn forward_prod_request(room: &mut Room, sender_id: Uuid, envelope: &Envelope) {
    if !room.prods.contains_key(&sender_id) {
        room.send_error_to(
            sender_id,
            "only prod clients may send 'get_prod_ui'".to_string(),
            envelope.request_id().map(String::from),
        );
        return;
    }

    match &room.runtime {
        Some(runtime) if runtime.is_open() => {
            let annotated = envelope.annotated("prodId", json!(sender_id.to_string()));
            runtime.send_text(annotated.to_string());
            counter!("bus_prod_requests_total").increment(1);
        }
        _ => {
            room.send_error_to(
                sender_id,
                "no runtime connected".to_string(),
                envelope.request_id().map(String::from),
            );
        }
    }
}

/// `prod_ui_response`: runtime -> the prod named by the embedded `prodId`.
fn forward_prod_reply(room: &mut Room, sender_id: Uuid, envelope: &Envelope) {
    if room.runtime.as_ref().map(|r| r.id) != Some(sender_id) {
        room.send_error_to(
            sender_id,
            "only the runtime may send 'prod_ui_response'".to_string(),
            envelope.request_id().map(String::from),
        );
        return;
    }

    let Some(prod_id) = envelope.str_field("prodId").and_then(|s| s.parse::<Uuid>().ok())
    else {
        room.send_error_to(
            sender_id,
            "'prod_ui_response' missing a valid prodId".to_string(),
            envelope.request_id().map(String::from),
        );
        return;
    };

    match room.prods.get(&prod_id) {
        Some(prod) if prod.is_open() => {
            prod.send_text(envelope.to_text());
        }
        _ => {
            // The prod disconnected while the runtime was rendering.
            debug!(
                "Dropping prod_ui_response for departed prod {} in {}",
                prod_id, room.project_id
            );
        }
    }
}

/// `check_agents`: synchronous, read-only, any sender.
fn report_agents(room: &mut Room, sender_id: Uuid) {
    evict_stale_agents(room);
    let agents: Vec<AgentInfo> = room
        .agents
        .values()
        .filter(|a| a.is_open())
        .map(|a| AgentInfo {
            id: a.id.to_string(),
            connected_at: a.connected_at,
            project_id: a.project_id.clone(),
        })
        .collect();

    room.send_frame_to(
        sender_id,
        &OutboundFrame::AgentStatusResponse {
            agents,
            timestamp: now_millis(),
        },
    );
}

fn evict_stale_agents(room: &mut Room) {
    room.agents.retain(|id, agent| {
        if agent.is_open() {
            true
        } else {
            debug!("Evicting stale agent {} from {}", id, room.project_id);
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{connect, recv_json, try_recv_json, TestRoom};
    use common::Role;
    use serde_json::json;

    /// Happy path: query forwarded with `runtimeId`, reply delivered
    /// unchanged, pending table drained.
    #[tokio::test]
    async fn test_query_round_trip() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (a, mut arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);
        let _ = recv_json(&mut arx);

        room.inbound_json(
            r,
            json!({"type": "graphql_query", "requestId": "q1", "projectId": "P", "query": "{ ping }", "timestamp": 1000}),
        )
        .await;

        let forwarded = recv_json(&mut arx);
        assert_eq!(forwarded["type"], "graphql_query");
        assert_eq!(forwarded["requestId"], "q1");
        assert_eq!(forwarded["query"], "{ ping }");
        assert_eq!(forwarded["runtimeId"], r.to_string());
        assert_eq!(room.0.pending.len(), 1);

        room.inbound_json(
            a,
            json!({"type": "query_response", "requestId": "q1", "projectId": "P", "data": {"ok": true}, "timestamp": 1010}),
        )
        .await;

        let reply = recv_json(&mut rrx);
        assert_eq!(reply["type"], "query_response");
        assert_eq!(reply["requestId"], "q1");
        assert_eq!(reply["data"]["ok"], true);
        // Delivered unchanged: no annotation leaked onto the reply.
        assert!(reply.get("runtimeId").is_none());
        assert!(room.0.pending.is_empty());
    }

    #[tokio::test]
    async fn test_docs_round_trip() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (a, mut arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);
        let _ = recv_json(&mut arx);

        room.inbound_json(r, json!({"type": "get_docs", "requestId": "d1", "timestamp": 1})).await;
        let forwarded = recv_json(&mut arx);
        assert_eq!(forwarded["type"], "get_docs");
        assert_eq!(forwarded["runtimeId"], r.to_string());

        room.inbound_json(
            a,
            json!({"type": "docs", "requestId": "d1", "data": {"docs": []}, "timestamp": 2}),
        )
        .await;
        assert_eq!(recv_json(&mut rrx)["type"], "docs");
        assert!(room.0.pending.is_empty());
    }

    /// No agent connected: deterministic fixture response, nothing pending.
    #[tokio::test]
    async fn test_no_agent_fallback() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let _ = recv_json(&mut rrx);

        room.inbound_json(
            r,
            json!({"type": "graphql_query", "requestId": "q2", "projectId": "P", "query": "users list", "timestamp": 2000}),
        )
        .await;

        let reply = recv_json(&mut rrx);
        assert_eq!(reply["type"], "query_response");
        assert_eq!(reply["requestId"], "q2");
        assert_eq!(reply["projectId"], "P");
        assert!(!reply["data"]["users"].as_array().unwrap().is_empty());
        assert!(room.0.pending.is_empty());
    }

    #[tokio::test]
    async fn test_no_agent_error_when_fixtures_disabled() {
        let mut room = TestRoom::new();
        room.0.settings.fallback_fixtures = false;
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let _ = recv_json(&mut rrx);

        room.inbound_json(
            r,
            json!({"type": "graphql_query", "requestId": "q2", "query": "users", "timestamp": 1}),
        )
        .await;

        let reply = recv_json(&mut rrx);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["requestId"], "q2");
        assert!(room.0.pending.is_empty());
    }

    #[tokio::test]
    async fn test_get_docs_fallback() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let _ = recv_json(&mut rrx);

        room.inbound_json(r, json!({"type": "get_docs", "requestId": "d1", "timestamp": 1})).await;
        let reply = recv_json(&mut rrx);
        assert_eq!(reply["type"], "docs");
        assert_eq!(reply["requestId"], "d1");
        assert!(!reply["data"]["docs"].as_array().unwrap().is_empty());
    }

    /// Stale agents are skipped and evicted; dispatch falls back.
    #[tokio::test]
    async fn test_stale_agent_evicted_at_dispatch() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (_a, arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);
        drop(arx);

        room.inbound_json(
            r,
            json!({"type": "graphql_query", "requestId": "q1", "query": "users", "timestamp": 1}),
        )
        .await;

        assert!(room.0.agents.is_empty());
        assert_eq!(recv_json(&mut rrx)["type"], "query_response");
        assert!(room.0.pending.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_reply_dropped() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (a, mut arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);
        let _ = recv_json(&mut arx);

        room.inbound_json(r, json!({"type": "graphql_query", "requestId": "q1", "timestamp": 1})).await;
        let _ = recv_json(&mut arx);

        let reply = json!({"type": "query_response", "requestId": "q1", "data": {}, "timestamp": 2});
        room.inbound_json(a, reply.clone()).await;
        assert_eq!(recv_json(&mut rrx)["type"], "query_response");

        // Second identical reply: dropped without an error.
        room.inbound_json(a, reply).await;
        assert!(try_recv_json(&mut rrx).is_none());
        assert!(try_recv_json(&mut arx).is_none());
    }

    /// Runtime reconnects while a request is in flight: the late reply is
    /// dropped and the new runtime sees nothing.
    #[tokio::test]
    async fn test_reply_to_replaced_runtime_dropped() {
        let mut room = TestRoom::new();
        let (r1, rx1) = connect(&mut room, Role::Runtime).await;
        let (a, mut arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut arx);

        room.inbound_json(r1, json!({"type": "graphql_query", "requestId": "q1", "timestamp": 1})).await;
        let _ = recv_json(&mut arx);

        // Old runtime dies and a new one takes the slot.
        drop(rx1);
        let (_r2, mut rx2) = connect(&mut room, Role::Runtime).await;
        let _ = recv_json(&mut rx2);

        room.inbound_json(a, json!({"type": "query_response", "requestId": "q1", "data": {}, "timestamp": 2})).await;
        assert!(try_recv_json(&mut rx2).is_none());
        assert!(room.0.pending.is_empty());
    }

    #[tokio::test]
    async fn test_prod_ui_round_trip() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (p, mut prx) = connect(&mut room, Role::Prod).await;
        let _ = recv_json(&mut rrx);
        let _ = recv_json(&mut prx);

        room.inbound_json(p, json!({"type": "get_prod_ui", "page": "home", "timestamp": 1})).await;
        let forwarded = recv_json(&mut rrx);
        assert_eq!(forwarded["type"], "get_prod_ui");
        assert_eq!(forwarded["prodId"], p.to_string());
        assert_eq!(forwarded["page"], "home");

        room.inbound_json(
            r,
            json!({"type": "prod_ui_response", "prodId": p.to_string(), "html": "<div/>", "timestamp": 2}),
        )
        .await;
        let reply = recv_json(&mut prx);
        assert_eq!(reply["type"], "prod_ui_response");
        assert_eq!(reply["html"], "<div/>");
    }

    #[tokio::test]
    async fn test_get_prod_ui_without_runtime_errors() {
        let mut room = TestRoom::new();
        let (p, mut prx) = connect(&mut room, Role::Prod).await;
        let _ = recv_json(&mut prx);

        room.inbound_json(p, json!({"type": "get_prod_ui", "timestamp": 1})).await;
        let err = recv_json(&mut prx);
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "no runtime connected");
    }

    #[tokio::test]
    async fn test_prod_ui_response_to_departed_prod_is_silent() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (p, prx) = connect(&mut room, Role::Prod).await;
        let _ = recv_json(&mut rrx);
        drop(prx);

        room.inbound_json(
            r,
            json!({"type": "prod_ui_response", "prodId": p.to_string(), "timestamp": 1}),
        )
        .await;
        assert!(try_recv_json(&mut rrx).is_none());
    }

    #[tokio::test]
    async fn test_prod_ui_response_missing_prod_id() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let _ = recv_json(&mut rrx);

        room.inbound_json(r, json!({"type": "prod_ui_response", "timestamp": 1})).await;
        let err = recv_json(&mut rrx);
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("prodId"));
    }

    #[tokio::test]
    async fn test_check_agents_reports_open_only() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (a1, mut a1rx) = connect(&mut room, Role::Agent).await;
        let (_a2, a2rx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);
        let _ = recv_json(&mut a1rx);
        drop(a2rx);

        room.inbound_json(r, json!({"type": "check_agents", "timestamp": 1})).await;
        let status = recv_json(&mut rrx);
        assert_eq!(status["type"], "agent_status_response");
        let agents = status["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0]["id"], a1.to_string());
        assert_eq!(agents[0]["projectId"], "P");
        assert!(agents[0]["connectedAt"].is_i64());
    }

    /// `check_agents` is idempotent and read-only.
    #[tokio::test]
    async fn test_check_agents_idempotent() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (_a, _arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);

        room.inbound_json(r, json!({"type": "check_agents", "timestamp": 1})).await;
        room.inbound_json(r, json!({"type": "check_agents", "timestamp": 2})).await;
        let first = recv_json(&mut rrx);
        let second = recv_json(&mut rrx);
        assert_eq!(first["agents"], second["agents"]);
        assert!(room.0.pending.is_empty());
    }

    /// N pings yield N pongs, sender only.
    #[tokio::test]
    async fn test_ping_pong() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (_a, mut arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);
        let _ = recv_json(&mut arx);

        for i in 0..3 {
            room.inbound_json(r, json!({"type": "ping", "timestamp": i})).await;
        }
        for _ in 0..3 {
            assert_eq!(recv_json(&mut rrx)["type"], "pong");
        }
        assert!(try_recv_json(&mut rrx).is_none());
        assert!(try_recv_json(&mut arx).is_none());
    }

    /// Inbound `error` envelopes are logged, never echoed.
    #[tokio::test]
    async fn test_inbound_error_not_echoed() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let _ = recv_json(&mut rrx);

        room.inbound_json(
            r,
            json!({"type": "error", "message": "client-side failure", "timestamp": 1}),
        )
        .await;
        assert!(try_recv_json(&mut rrx).is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_dropped() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let _ = recv_json(&mut rrx);

        room.inbound_json(r, json!({"type": "mystery_frame", "timestamp": 1})).await;
        assert!(try_recv_json(&mut rrx).is_none());
    }

    /// Sender-role mismatches are input-format errors with no side effects.
    #[tokio::test]
    async fn test_role_mismatch_rejected() {
        let mut room = TestRoom::new();
        let (_r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (a, mut arx) = connect(&mut room, Role::Agent).await;
        let _ = recv_json(&mut rrx);
        let _ = recv_json(&mut arx);

        // An agent may not issue queries.
        room.inbound_json(a, json!({"type": "graphql_query", "requestId": "q9", "timestamp": 1})).await;
        let err = recv_json(&mut arx);
        assert_eq!(err["type"], "error");
        assert_eq!(err["requestId"], "q9");
        assert!(room.0.pending.is_empty());
        assert!(try_recv_json(&mut rrx).is_none());

        // An agent reply with no matching pending entry is silently dropped.
        room.inbound_json(a, json!({"type": "query_response", "requestId": "nope", "timestamp": 2})).await;
        assert!(try_recv_json(&mut arx).is_none());
    }
}
