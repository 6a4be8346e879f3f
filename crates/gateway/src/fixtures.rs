//! Deterministic fallback payloads.
//!
//! When a runtime issues a query and no agent is connected, the room can
//! answer with a synthesized payload instead of an error. Payloads are picked
//! by substring match on the query text and are fully deterministic, so the
//! same query always produces the same response. Gated by the
//! `fallback_fixtures` config flag.

use serde_json::{json, Value};

/// Fixture payload for a `graphql_query` with no agent available.
pub fn query_fixture(query: &str) -> Value {
    let q = query.to_lowercase();
    if q.contains("user") {
        json!({
            "users": [
                {"id": "u1", "name": "Ada Lovelace", "email": "ada@example.com"},
                {"id": "u2", "name": "Grace Hopper", "email": "grace@example.com"},
                {"id": "u3", "name": "Edsger Dijkstra", "email": "edsger@example.com"}
            ]
        })
    } else if q.contains("product") {
        json!({
            "products": [
                {"id": "p1", "name": "Widget", "price": 9.99},
                {"id": "p2", "name": "Gadget", "price": 24.5}
            ]
        })
    } else if q.contains("order") {
        json!({
            "orders": [
                {"id": "o1", "status": "shipped", "total": 34.49},
                {"id": "o2", "status": "pending", "total": 9.99}
            ]
        })
    } else if q.contains("ping") {
        json!({"ping": "pong"})
    } else {
        json!({"items": [], "note": "no agent connected"})
    }
}

/// Fixture payload for a `get_docs` with no agent available.
pub fn docs_fixture() -> Value {
    json!({
        "docs": [
            {
                "path": "getting-started.md",
                "title": "Getting Started",
                "content": "Connect a runtime and an agent to the same project to route queries."
            },
            {
                "path": "roles.md",
                "title": "Client Roles",
                "content": "runtime issues queries, agent serves them, prod fetches UI, admin observes."
            }
        ]
    })
}
