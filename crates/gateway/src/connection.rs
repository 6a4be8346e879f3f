//! Per-socket plumbing.
//!
//! Each accepted WebSocket gets an unbounded outbound channel bridged to the
//! sink by a writer task; the reader loop feeds decoded frames into the
//! owning room as events. The room never touches the socket directly, only
//! the channel, so a dead peer can never block the room's executor.

use crate::room::RoomHandle;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use common::{now_millis, OutboundFrame, Role};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request metadata captured at upgrade time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub user_agent: Option<String>,
    pub origin: Option<String>,
}

/// A client socket as seen by its room.
#[derive(Debug)]
pub struct Connection {
    /// Server-minted unique id.
    pub id: Uuid,
    pub role: Role,
    pub project_id: String,
    /// Channel to the socket's writer task.
    pub tx: mpsc::UnboundedSender<Message>,
    pub connected_at: i64,
    pub metadata: ConnectionMetadata,
}

impl Connection {
    pub fn new(
        role: Role,
        project_id: String,
        tx: mpsc::UnboundedSender<Message>,
        metadata: ConnectionMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            project_id,
            tx,
            connected_at: now_millis(),
            metadata,
        }
    }

    /// Whether the socket is still deliverable. The channel closes when the
    /// writer task exits, which tracks the underlying socket state.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Send a pre-serialized frame. Returns false when the peer is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Message::Text(text.into())).is_ok()
    }

    /// Serialize and send a bus-originated frame.
    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.send_text(json),
            Err(e) => {
                warn!("Failed to serialize outbound frame: {}", e);
                false
            }
        }
    }

    /// Queue a close frame; delivery is best-effort.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }

    /// Close with code 1008 (policy violation).
    pub fn close_policy(&self, reason: &str) {
        self.close(close_code::POLICY, reason);
    }
}

/// Drive one upgraded socket until it disconnects.
pub async fn serve_socket(
    socket: WebSocket,
    room: RoomHandle,
    role: Role,
    metadata: ConnectionMetadata,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let keepalive = tx.clone();
    let conn = Connection::new(role, room.project_id().to_string(), tx, metadata);
    let client_id = conn.id;

    counter!("bus_connections_total", "role" => role.as_str()).increment(1);
    info!("Client {} connected as {} to {}", client_id, role, room.project_id());

    // Writer task: channel -> socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    if !room.attach(conn) {
        debug!("Room for {} exited before attach", room.project_id());
        send_task.abort();
        return;
    }

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if !room.inbound(client_id, text.to_string()) {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                // Binary frames are treated as UTF-8 JSON like text frames;
                // anything non-UTF-8 fails envelope parsing downstream.
                let text = String::from_utf8_lossy(&data).to_string();
                if !room.inbound(client_id, text) {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                if keepalive.send(Message::Pong(data)).is_err() {
                    break;
                }
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("WebSocket error for {}: {}", client_id, e);
                break;
            }
        }
    }

    room.disconnect(client_id);
    send_task.abort();

    counter!("bus_disconnections_total", "role" => role.as_str()).increment(1);
    info!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Connection::new(
                Role::Agent,
                "P".to_string(),
                tx,
                ConnectionMetadata::default(),
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn test_open_tracks_receiver() {
        let (conn, rx) = test_conn();
        assert!(conn.is_open());
        drop(rx);
        assert!(!conn.is_open());
        assert!(!conn.send_text("{}".to_string()));
    }

    #[tokio::test]
    async fn test_close_queues_policy_frame() {
        let (conn, mut rx) = test_conn();
        conn.close_policy("runtime already connected");
        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::POLICY);
                assert_eq!(frame.reason.as_str(), "runtime already connected");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
