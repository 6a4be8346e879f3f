//! Shared helpers for room and routing tests.

use crate::connection::{Connection, ConnectionMetadata};
use crate::room::{Room, RoomEvent, RoomSettings};
use axum::extract::ws::Message;
use common::Role;
use serde_json::Value;
use std::sync::Arc;
use storage::{MemoryStore, Result as StorageResult, RoomStore, StorageError, StoredLog, UsageReport};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A room driven directly by tests, no task or real sockets involved.
pub(crate) struct TestRoom(pub(crate) Room);

impl TestRoom {
    pub(crate) fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub(crate) fn with_store(store: Arc<dyn RoomStore>) -> Self {
        TestRoom(Room::new("P".to_string(), store, RoomSettings::default()))
    }

    /// Feed one inbound frame from `client_id`.
    pub(crate) async fn inbound_json(&mut self, client_id: Uuid, value: Value) {
        self.0
            .handle_event(RoomEvent::Inbound {
                client_id,
                text: value.to_string(),
            })
            .await;
    }
}

/// Attach a loopback connection; the receiver observes everything the room
/// sends to it. Dropping the receiver makes the connection non-OPEN.
pub(crate) async fn connect(
    room: &mut TestRoom,
    role: Role,
) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Connection::new(
        role,
        room.0.project_id.clone(),
        tx,
        ConnectionMetadata::default(),
    );
    let id = conn.id;
    room.0.handle_event(RoomEvent::Attach(conn)).await;
    (id, rx)
}

/// Next frame sent to this connection, parsed as JSON. Panics when none is
/// queued or the frame is not text.
pub(crate) fn recv_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
    match rx.try_recv().expect("expected a queued frame") {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("frame must be JSON"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Next queued text frame, if any.
pub(crate) fn try_recv_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Value> {
    match rx.try_recv().ok()? {
        Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}

fn storage_error() -> StorageError {
    StorageError::Json(serde_json::from_str::<Value>("!").unwrap_err())
}

/// Store whose every operation fails, for best-effort-persistence tests.
pub(crate) struct FailingStore;

#[async_trait::async_trait]
impl RoomStore for FailingStore {
    async fn append_log(&self, _project_id: &str, _log: StoredLog) -> StorageResult<()> {
        Err(storage_error())
    }

    async fn recent_logs(
        &self,
        _project_id: &str,
        _hours: u32,
        _limit: usize,
    ) -> StorageResult<Vec<StoredLog>> {
        Err(storage_error())
    }

    async fn compact_logs(&self, _project_id: &str, _retention_hours: u32) -> StorageResult<usize> {
        Err(storage_error())
    }

    async fn record_usage(&self, _project_id: &str, _ts_millis: i64) -> StorageResult<()> {
        Err(storage_error())
    }

    async fn usage_report(&self, _project_id: &str) -> StorageResult<UsageReport> {
        Err(storage_error())
    }
}
