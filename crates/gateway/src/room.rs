//! Per-project room actor.
//!
//! One task per live project owns every piece of room state: the role maps,
//! the pending-request table, the idle alarm, and the deadline heap. Events
//! (socket attach, inbound frame, disconnect, operational queries, timer
//! fires) are consumed from a single queue in FIFO order, so the state is
//! never touched concurrently. Nothing in here is fatal: a room only ever
//! terminates through its idle alarm.
//!
//! Timeouts do not spawn per-request tasks. Each pending request carries a
//! deadline that is pushed onto a min-heap; the event loop sleeps until the
//! earliest deadline (or the idle alarm) and expires due entries when it
//! wakes.

use crate::connection::Connection;
use crate::rooms::Rooms;
use crate::{fanout, routing};
use common::{now_millis, Envelope, OutboundFrame, Role};
use metrics::{counter, gauge};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use storage::{Direction, RoomStore, StoredLog, LOG_RETENTION_HOURS};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cap on the history batch replayed to a newly connected admin.
pub const ADMIN_REPLAY_LIMIT: usize = 500;

/// History window replayed to a newly connected admin, in hours.
pub const ADMIN_REPLAY_HOURS: u32 = 24;

/// Per-room tunables, injected at startup.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub request_timeout_ms: i64,
    pub idle_linger_ms: i64,
    pub fallback_fixtures: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            idle_linger_ms: 300_000,
            fallback_fixtures: true,
        }
    }
}

/// What a pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Query,
    Docs,
}

/// A runtime-issued request awaiting its reply.
///
/// The entry in the deadline heap is the timeout handle: removing the map
/// entry cancels the timeout, because a popped deadline only fires when the
/// map still holds a matching entry.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub request_id: String,
    pub runtime_id: Uuid,
    pub created_at: i64,
    pub kind: PendingKind,
    pub deadline: i64,
}

/// Verdict for a pre-upgrade admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accept,
    /// An OPEN runtime already holds the singleton slot.
    RuntimeConflict,
}

/// Events a room consumes, in FIFO order.
#[derive(Debug)]
pub enum RoomEvent {
    Attach(Connection),
    Inbound {
        client_id: Uuid,
        text: String,
    },
    Disconnect {
        client_id: Uuid,
    },
    Admission {
        role: Role,
        reply: oneshot::Sender<AdmissionDecision>,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
    Health {
        reply: oneshot::Sender<RoomHealth>,
    },
}

/// One connection in a `/status` snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub id: String,
    pub connected_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ClientSnapshot {
    fn of(conn: &Connection) -> Self {
        Self {
            id: conn.id.to_string(),
            connected_at: conn.connected_at,
            user_agent: conn.metadata.user_agent.clone(),
            origin: conn.metadata.origin.clone(),
        }
    }
}

/// Room snapshot served on `GET /status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ClientSnapshot>,
    pub agents: Vec<ClientSnapshot>,
    pub prods: Vec<ClientSnapshot>,
    pub admins: Vec<ClientSnapshot>,
    pub pending_requests: usize,
    pub last_activity: i64,
    pub timestamp: i64,
}

/// Minimal per-room liveness served on `GET /health?projectId=`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomHealth {
    pub status: String,
    pub project_id: String,
    pub timestamp: i64,
}

/// Handle to a live room task.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    project_id: Arc<str>,
    epoch: Uuid,
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomHandle {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub(crate) fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// True once the room task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hand an upgraded connection to the room. False when the room is gone.
    pub fn attach(&self, conn: Connection) -> bool {
        self.tx.send(RoomEvent::Attach(conn)).is_ok()
    }

    /// Feed one inbound frame. False when the room is gone.
    pub fn inbound(&self, client_id: Uuid, text: String) -> bool {
        self.tx.send(RoomEvent::Inbound { client_id, text }).is_ok()
    }

    pub fn disconnect(&self, client_id: Uuid) {
        let _ = self.tx.send(RoomEvent::Disconnect { client_id });
    }

    /// Pre-upgrade admission check (runtime singleton rule).
    pub async fn admission(&self, role: Role) -> Option<AdmissionDecision> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomEvent::Admission { role, reply }).ok()?;
        rx.await.ok()
    }

    pub async fn status(&self) -> Option<RoomStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomEvent::Status { reply }).ok()?;
        rx.await.ok()
    }

    pub async fn health(&self) -> Option<RoomHealth> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomEvent::Health { reply }).ok()?;
        rx.await.ok()
    }
}

/// Spawn a room task and return its handle.
pub(crate) fn spawn_room(
    project_id: &str,
    store: Arc<dyn RoomStore>,
    settings: RoomSettings,
    rooms: Rooms,
) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let epoch = Uuid::new_v4();
    let handle = RoomHandle {
        project_id: Arc::from(project_id),
        epoch,
        tx,
    };

    let room = Room::new(project_id.to_string(), store, settings);
    tokio::spawn(room.run(rx, rooms, epoch));
    handle
}

/// The state machine. Owned exclusively by its task; tests drive it directly.
pub(crate) struct Room {
    pub(crate) project_id: String,
    pub(crate) settings: RoomSettings,
    pub(crate) store: Arc<dyn RoomStore>,
    pub(crate) runtime: Option<Connection>,
    pub(crate) agents: HashMap<Uuid, Connection>,
    pub(crate) prods: HashMap<Uuid, Connection>,
    pub(crate) admins: HashMap<Uuid, Connection>,
    pub(crate) pending: HashMap<String, PendingRequest>,
    /// Min-heap of `(deadline, requestId)`; lazily invalidated.
    pub(crate) deadlines: BinaryHeap<Reverse<(i64, String)>>,
    pub(crate) last_activity: i64,
    /// When set, the idle alarm fires at this instant.
    pub(crate) idle_deadline: Option<i64>,
}

impl Room {
    pub(crate) fn new(project_id: String, store: Arc<dyn RoomStore>, settings: RoomSettings) -> Self {
        Self {
            project_id,
            settings,
            store,
            runtime: None,
            agents: HashMap::new(),
            prods: HashMap::new(),
            admins: HashMap::new(),
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            last_activity: now_millis(),
            idle_deadline: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomEvent>, rooms: Rooms, epoch: Uuid) {
        info!("Room {} started", self.project_id);
        loop {
            tokio::select! {
                biased;

                ev = rx.recv() => match ev {
                    Some(ev) => self.handle_event(ev).await,
                    None => break,
                },

                _ = wake_at(self.next_wake()) => {
                    let now = now_millis();
                    self.expire_due(now);
                    if self.idle_alarm_due(now) && self.on_idle_alarm().await {
                        break;
                    }
                }
            }
        }
        rooms.deregister(&self.project_id, epoch);
        info!("Room {} suspended", self.project_id);
    }

    pub(crate) async fn handle_event(&mut self, ev: RoomEvent) {
        match ev {
            RoomEvent::Attach(conn) => self.attach(conn).await,
            RoomEvent::Inbound { client_id, text } => self.on_inbound(client_id, &text).await,
            RoomEvent::Disconnect { client_id } => self.on_disconnect(client_id),
            RoomEvent::Admission { role, reply } => {
                let _ = reply.send(self.admission_decision(role));
            }
            RoomEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            RoomEvent::Health { reply } => {
                let _ = reply.send(RoomHealth {
                    status: "healthy".to_string(),
                    project_id: self.project_id.clone(),
                    timestamp: now_millis(),
                });
            }
        }
    }

    pub(crate) fn admission_decision(&self, role: Role) -> AdmissionDecision {
        match role {
            Role::Runtime if self.runtime.as_ref().is_some_and(Connection::is_open) => {
                AdmissionDecision::RuntimeConflict
            }
            _ => AdmissionDecision::Accept,
        }
    }

    async fn attach(&mut self, conn: Connection) {
        self.touch();

        if conn.role == Role::Runtime {
            if let Some(existing) = &self.runtime {
                if existing.is_open() {
                    // Lost the admission race: another runtime connected
                    // between the pre-upgrade check and this attach.
                    warn!(
                        "Rejecting second runtime {} for {}",
                        conn.id, self.project_id
                    );
                    conn.close_policy("a runtime is already connected");
                    counter!("bus_runtime_conflicts_total").increment(1);
                    return;
                }
                let stale_id = existing.id;
                debug!(
                    "Replacing stale runtime {} in {}",
                    stale_id, self.project_id
                );
                self.cancel_pending_for_runtime(stale_id);
            }
        }

        conn.send_frame(&OutboundFrame::Connected {
            client_id: conn.id.to_string(),
            client_type: conn.role,
            project_id: self.project_id.clone(),
            message: format!(
                "Connected to project {} as {}",
                self.project_id, conn.role
            ),
            timestamp: now_millis(),
        });

        info!(
            "Client {} attached to {} as {}",
            conn.id, self.project_id, conn.role
        );

        match conn.role {
            Role::Runtime => self.runtime = Some(conn),
            Role::Agent => {
                self.agents.insert(conn.id, conn);
            }
            Role::Prod => {
                self.prods.insert(conn.id, conn);
            }
            Role::Admin => {
                fanout::replay_history(self.store.as_ref(), &self.project_id, &conn).await;
                self.admins.insert(conn.id, conn);
            }
        }
        gauge!("bus_active_connections").set(self.connection_count() as f64);
    }

    async fn on_inbound(&mut self, client_id: Uuid, text: &str) {
        self.touch();

        let Some(sender_role) = self.role_of(client_id) else {
            debug!("Frame from unknown client {} dropped", client_id);
            return;
        };

        let envelope = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                counter!("bus_parse_errors_total").increment(1);
                self.send_error_to(client_id, e.to_string(), None);
                return;
            }
        };

        counter!("bus_messages_total", "type" => envelope.type_name().to_string()).increment(1);

        self.journal(client_id, sender_role, &envelope).await;
        fanout::fan_out_to_admins(self, client_id, &envelope);
        routing::dispatch(self, client_id, &envelope);
    }

    /// Persist the inbound message and bump the usage counters. Best-effort:
    /// routing never depends on persistence succeeding.
    async fn journal(&self, client_id: Uuid, sender_role: Role, envelope: &Envelope) {
        let now = now_millis();
        let log = StoredLog {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            message_type: envelope.type_name().to_string(),
            direction: Direction::Incoming,
            envelope: envelope.value().clone(),
            client_id: Some(client_id.to_string()),
            client_role: Some(sender_role),
            project_id: self.project_id.clone(),
            from_client_id: None,
        };
        if let Err(e) = self.store.append_log(&self.project_id, log).await {
            error!("Failed to journal message for {}: {}", self.project_id, e);
        }
        if let Err(e) = self.store.record_usage(&self.project_id, now).await {
            error!("Failed to record usage for {}: {}", self.project_id, e);
        }
    }

    fn on_disconnect(&mut self, client_id: Uuid) {
        self.touch();

        if self.runtime.as_ref().is_some_and(|r| r.id == client_id) {
            self.runtime = None;
            self.cancel_pending_for_runtime(client_id);
            debug!("Runtime {} left {}", client_id, self.project_id);
        } else if self.agents.remove(&client_id).is_some() {
            // Pending requests stay: they time out or are satisfied by
            // another agent's reply.
            debug!("Agent {} left {}", client_id, self.project_id);
        } else if self.prods.remove(&client_id).is_some() {
            debug!("Prod {} left {}", client_id, self.project_id);
        } else if self.admins.remove(&client_id).is_some() {
            debug!("Admin {} left {}", client_id, self.project_id);
        } else {
            return;
        }

        gauge!("bus_active_connections").set(self.connection_count() as f64);

        if self.is_idle() {
            self.idle_deadline = Some(now_millis() + self.settings.idle_linger_ms);
            debug!("Room {} idle, alarm armed", self.project_id);
        }
    }

    /// Idle means no runtime and no agents; passive observers don't keep the
    /// room hot.
    pub(crate) fn is_idle(&self) -> bool {
        self.runtime.is_none() && self.agents.is_empty()
    }

    pub(crate) fn idle_alarm_due(&self, now: i64) -> bool {
        self.idle_deadline.is_some_and(|d| d <= now)
    }

    /// Idle alarm body. Returns true when the task should exit.
    pub(crate) async fn on_idle_alarm(&mut self) -> bool {
        self.idle_deadline = None;
        if !self.is_idle() {
            return false;
        }

        let cancelled = self.pending.len();
        self.pending.clear();
        self.deadlines.clear();
        if cancelled > 0 {
            debug!(
                "Cancelled {} residual pending requests in idle {}",
                cancelled, self.project_id
            );
        }

        if let Err(e) = self
            .store
            .compact_logs(&self.project_id, LOG_RETENTION_HOURS)
            .await
        {
            error!("Log compaction failed for {}: {}", self.project_id, e);
        }

        if self.connection_count() == 0 {
            return true;
        }
        // Passive sockets still need a live reader; try again later.
        self.idle_deadline = Some(now_millis() + self.settings.idle_linger_ms);
        false
    }

    /// Activity on any socket disarms the idle alarm.
    fn touch(&mut self) {
        self.last_activity = now_millis();
        self.idle_deadline = None;
    }

    // ========================================================================
    // Pending-request table
    // ========================================================================

    pub(crate) fn insert_pending(&mut self, request_id: String, runtime_id: Uuid, kind: PendingKind) {
        let now = now_millis();
        let deadline = now + self.settings.request_timeout_ms;
        self.deadlines
            .push(Reverse((deadline, request_id.clone())));
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                request_id,
                runtime_id,
                created_at: now,
                kind,
                deadline,
            },
        );
    }

    pub(crate) fn remove_pending(&mut self, request_id: &str) -> Option<PendingRequest> {
        // The heap entry stays behind and is skipped when it surfaces.
        self.pending.remove(request_id)
    }

    fn cancel_pending_for_runtime(&mut self, runtime_id: Uuid) {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.runtime_id != runtime_id);
        let cancelled = before - self.pending.len();
        if cancelled > 0 {
            debug!(
                "Cancelled {} pending requests for departed runtime {}",
                cancelled, runtime_id
            );
        }
    }

    /// Expire every pending request whose deadline has passed, emitting the
    /// timeout error to the issuing runtime.
    pub(crate) fn expire_due(&mut self, now: i64) {
        while let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, request_id))) = self.deadlines.pop() else {
                break;
            };
            // Skip entries whose pending record was already satisfied or
            // cancelled, and superseded entries for a re-used request id.
            let matches = self
                .pending
                .get(&request_id)
                .is_some_and(|p| p.deadline == deadline);
            if !matches {
                continue;
            }
            let Some(pending) = self.pending.remove(&request_id) else {
                continue;
            };

            counter!("bus_request_timeouts_total").increment(1);
            warn!(
                "Request {} in {} timed out after {}ms",
                request_id, self.project_id, self.settings.request_timeout_ms
            );
            self.send_error_to(
                pending.runtime_id,
                format!("timeout after {}ms", self.settings.request_timeout_ms),
                Some(pending.request_id),
            );
        }
    }

    /// Earliest instant the loop must wake at, if any.
    pub(crate) fn next_wake(&self) -> Option<i64> {
        let next_deadline = self.deadlines.peek().map(|Reverse((d, _))| *d);
        match (next_deadline, self.idle_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    // ========================================================================
    // Lookup & delivery
    // ========================================================================

    pub(crate) fn role_of(&self, client_id: Uuid) -> Option<Role> {
        if self.runtime.as_ref().is_some_and(|r| r.id == client_id) {
            Some(Role::Runtime)
        } else if self.agents.contains_key(&client_id) {
            Some(Role::Agent)
        } else if self.prods.contains_key(&client_id) {
            Some(Role::Prod)
        } else if self.admins.contains_key(&client_id) {
            Some(Role::Admin)
        } else {
            None
        }
    }

    pub(crate) fn connection(&self, client_id: Uuid) -> Option<&Connection> {
        if let Some(r) = &self.runtime {
            if r.id == client_id {
                return Some(r);
            }
        }
        self.agents
            .get(&client_id)
            .or_else(|| self.prods.get(&client_id))
            .or_else(|| self.admins.get(&client_id))
    }

    pub(crate) fn send_text_to(&self, client_id: Uuid, text: String) -> bool {
        self.connection(client_id)
            .map(|c| c.send_text(text))
            .unwrap_or(false)
    }

    pub(crate) fn send_frame_to(&self, client_id: Uuid, frame: &OutboundFrame) -> bool {
        self.connection(client_id)
            .map(|c| c.send_frame(frame))
            .unwrap_or(false)
    }

    pub(crate) fn send_error_to(
        &self,
        client_id: Uuid,
        message: String,
        request_id: Option<String>,
    ) -> bool {
        self.send_frame_to(
            client_id,
            &OutboundFrame::Error {
                message,
                request_id,
                project_id: self.project_id.clone(),
                timestamp: now_millis(),
            },
        )
    }

    pub(crate) fn connection_count(&self) -> usize {
        usize::from(self.runtime.is_some())
            + self.agents.len()
            + self.prods.len()
            + self.admins.len()
    }

    fn status(&self) -> RoomStatus {
        RoomStatus {
            project_id: self.project_id.clone(),
            runtime: self.runtime.as_ref().map(ClientSnapshot::of),
            agents: self.agents.values().map(ClientSnapshot::of).collect(),
            prods: self.prods.values().map(ClientSnapshot::of).collect(),
            admins: self.admins.values().map(ClientSnapshot::of).collect(),
            pending_requests: self.pending.len(),
            last_activity: self.last_activity,
            timestamp: now_millis(),
        }
    }
}

/// Sleep until the given epoch-millis instant; forever when `None`.
async fn wake_at(deadline: Option<i64>) {
    match deadline {
        Some(ms) => {
            let delta = (ms - now_millis()).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(delta)).await;
        }
        None => std::future::pending::<()>().await,
    }
}
