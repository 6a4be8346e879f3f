//! Admin observer fan-out and history replay.
//!
//! Every inbound application message is mirrored to the OPEN admin sockets
//! (minus the sender) with a `_meta` block naming the original sender. Newly
//! connected admins get a one-shot `historical_logs` frame with the last
//! 24 h of journaled traffic.

use crate::connection::Connection;
use crate::room::{Room, ADMIN_REPLAY_HOURS, ADMIN_REPLAY_LIMIT};
use common::{now_millis, Envelope, OutboundFrame};
use metrics::counter;
use serde_json::json;
use storage::RoomStore;
use tracing::{debug, error};
use uuid::Uuid;

/// Mirror one inbound message to every OPEN admin except the sender.
///
/// The decorated copy is serialized once; stale admins are skipped, not
/// evicted (their disconnect event does the cleanup).
pub(crate) fn fan_out_to_admins(room: &Room, sender_id: Uuid, envelope: &Envelope) {
    if room.admins.is_empty() {
        return;
    }

    let decorated = envelope.annotated(
        "_meta",
        json!({
            "from": sender_id.to_string(),
            "projectId": room.project_id,
            "forwardedAt": now_millis(),
        }),
    );
    let text = decorated.to_string();

    let mut delivered: u64 = 0;
    for (id, admin) in &room.admins {
        if *id == sender_id || !admin.is_open() {
            continue;
        }
        if admin.send_text(text.clone()) {
            delivered += 1;
        } else {
            debug!("Skipping undeliverable admin {} in {}", id, room.project_id);
        }
    }
    if delivered > 0 {
        counter!("bus_admin_fanout_total").increment(delivered);
    }
}

/// Send the 24 h history batch to a freshly admitted admin.
///
/// Always exactly one `historical_logs` frame, even when the history is
/// empty or the store read fails.
pub(crate) async fn replay_history(store: &dyn RoomStore, project_id: &str, admin: &Connection) {
    let logs = match store
        .recent_logs(project_id, ADMIN_REPLAY_HOURS, ADMIN_REPLAY_LIMIT)
        .await
    {
        Ok(logs) => logs,
        Err(e) => {
            error!("History replay read failed for {}: {}", project_id, e);
            Vec::new()
        }
    };

    let count = logs.len();
    let entries = logs
        .into_iter()
        .filter_map(|log| serde_json::to_value(log).ok())
        .collect();

    admin.send_frame(&OutboundFrame::HistoricalLogs {
        logs: entries,
        count,
        timestamp: now_millis(),
    });
    counter!("bus_admin_replays_total").increment(1);
}

#[cfg(test)]
mod tests {
    use crate::testutil::{connect, recv_json, try_recv_json, TestRoom};
    use common::Role;
    use serde_json::json;

    /// Admins see a decorated copy of every inbound message; the sender
    /// never receives its own frame back.
    #[tokio::test]
    async fn test_fan_out_decorates_and_skips_sender() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (_ad1, mut ad1rx) = connect(&mut room, Role::Admin).await;
        let (ad2, mut ad2rx) = connect(&mut room, Role::Admin).await;
        let _ = recv_json(&mut rrx);
        // connected + historical_logs each
        let _ = recv_json(&mut ad1rx);
        let _ = recv_json(&mut ad1rx);
        let _ = recv_json(&mut ad2rx);
        let _ = recv_json(&mut ad2rx);

        room.inbound_json(r, json!({"type": "ping", "payload": 42, "timestamp": 1})).await;

        for rx in [&mut ad1rx, &mut ad2rx] {
            let copy = recv_json(rx);
            assert_eq!(copy["type"], "ping");
            assert_eq!(copy["payload"], 42);
            assert_eq!(copy["_meta"]["from"], r.to_string());
            assert_eq!(copy["_meta"]["projectId"], "P");
            assert!(copy["_meta"]["forwardedAt"].is_i64());
        }

        // An admin's own message fans out to the other admin only.
        room.inbound_json(ad2, json!({"type": "ping", "timestamp": 2})).await;
        let copy = recv_json(&mut ad1rx);
        assert_eq!(copy["_meta"]["from"], ad2.to_string());
        // ad2 got its pong but no mirrored copy of its own frame.
        let pong = recv_json(&mut ad2rx);
        assert_eq!(pong["type"], "pong");
        assert!(try_recv_json(&mut ad2rx).is_none());
    }

    #[tokio::test]
    async fn test_fan_out_skips_stale_admin() {
        let mut room = TestRoom::new();
        let (r, mut rrx) = connect(&mut room, Role::Runtime).await;
        let (_ad, adrx) = connect(&mut room, Role::Admin).await;
        let _ = recv_json(&mut rrx);
        drop(adrx);

        // Must not error or evict; disconnect cleanup owns the removal.
        room.inbound_json(r, json!({"type": "ping", "timestamp": 1})).await;
        assert_eq!(room.0.admins.len(), 1);
        assert_eq!(recv_json(&mut rrx)["type"], "pong");
    }
}
