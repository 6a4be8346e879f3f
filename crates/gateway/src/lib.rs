//! Multi-tenant real-time message bus.
//!
//! Isolates per-project WebSocket traffic into room actors and routes JSON
//! envelopes between four client roles: a singleton `runtime` that issues
//! queries, `agent`s that serve them, `prod` clients that fetch prebuilt UI
//! through the runtime, and `admin` observers that see everything.
//!
//! ## Architecture
//!
//! ```text
//! HTTP / WebSocket
//!         ↓
//! Front router (stateless: auth, project resolution, CORS)
//!         ↓
//! Rooms registry (DashMap, same project id → same room)
//!         ↓
//! Room actor (one task per project: role maps, pending table, idle alarm)
//!    ↓              ↓                 ↓
//! routing      admin fan-out     durable store (log buckets, usage)
//! ```
//!
//! ## Design points
//!
//! - Each room is single-threaded with respect to its own state: every
//!   event goes through one FIFO queue.
//! - Request timeouts live in a per-room deadline heap polled by the room
//!   loop; no per-request timer tasks.
//! - Idle rooms (no runtime, no agents) arm an alarm and exit once nothing
//!   is attached; history buckets and usage counters persist independently.
//! - Sends never block the room: dead peers are evicted or skipped.

pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod fixtures;
pub mod front;
pub mod room;
pub mod rooms;
pub mod routing;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use connection::{Connection, ConnectionMetadata};
pub use error::{GatewayError, Result};
pub use front::{create_router, AppState};
pub use room::{
    AdmissionDecision, RoomHandle, RoomHealth, RoomSettings, RoomStatus,
};
pub use rooms::Rooms;
