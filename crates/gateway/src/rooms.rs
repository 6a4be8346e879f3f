//! Cross-room registry.
//!
//! Deterministic project-to-room mapping: the same project id always
//! resolves to the same live room task. Rooms deregister themselves when
//! their idle alarm lets them exit; a handle whose task is gone is replaced
//! on the next resolve.

use crate::room::{spawn_room, RoomHandle, RoomSettings};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use std::sync::Arc;
use storage::RoomStore;
use tracing::debug;
use uuid::Uuid;

struct RoomsInner {
    rooms: DashMap<String, RoomHandle>,
    store: Arc<dyn RoomStore>,
    settings: RoomSettings,
}

/// Registry of live rooms, shared by the front router.
#[derive(Clone)]
pub struct Rooms {
    inner: Arc<RoomsInner>,
}

impl Rooms {
    pub fn new(store: Arc<dyn RoomStore>, settings: RoomSettings) -> Self {
        Self {
            inner: Arc::new(RoomsInner {
                rooms: DashMap::new(),
                store,
                settings,
            }),
        }
    }

    /// The live room for a project, spawning one on first use.
    pub fn resolve(&self, project_id: &str) -> RoomHandle {
        let handle = match self.inner.rooms.entry(project_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    let handle = self.spawn(project_id);
                    occupied.insert(handle.clone());
                    handle
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let handle = self.spawn(project_id);
                vacant.insert(handle.clone());
                handle
            }
        };
        // Outside the entry guard: DashMap::len locks every shard.
        gauge!("bus_rooms_active").set(self.inner.rooms.len() as f64);
        handle
    }

    fn spawn(&self, project_id: &str) -> RoomHandle {
        spawn_room(
            project_id,
            self.inner.store.clone(),
            self.inner.settings.clone(),
            self.clone(),
        )
    }

    /// Called by a room task on exit. The epoch guard keeps a freshly
    /// respawned room from being evicted by its predecessor's shutdown.
    pub(crate) fn deregister(&self, project_id: &str, epoch: Uuid) {
        self.inner
            .rooms
            .remove_if(project_id, |_, handle| handle.epoch() == epoch);
        gauge!("bus_rooms_active").set(self.inner.rooms.len() as f64);
        debug!("Room {} deregistered", project_id);
    }

    /// Drop handles whose task has exited. Belt for the idle-exit path,
    /// driven by a coarse process-level interval.
    pub fn sweep(&self) {
        self.inner.rooms.retain(|_, handle| !handle.is_closed());
        gauge!("bus_rooms_active").set(self.inner.rooms.len() as f64);
    }

    pub fn live_rooms(&self) -> usize {
        self.inner.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStore;

    fn registry() -> Rooms {
        Rooms::new(Arc::new(MemoryStore::new()), RoomSettings::default())
    }

    #[tokio::test]
    async fn test_same_project_same_room() {
        let rooms = registry();
        let a = rooms.resolve("P");
        let b = rooms.resolve("P");
        assert_eq!(a.epoch(), b.epoch());
        assert_eq!(rooms.live_rooms(), 1);
    }

    #[tokio::test]
    async fn test_distinct_projects_distinct_rooms() {
        let rooms = registry();
        let a = rooms.resolve("P");
        let b = rooms.resolve("Q");
        assert_ne!(a.epoch(), b.epoch());
        assert_eq!(rooms.live_rooms(), 2);
    }

    #[tokio::test]
    async fn test_rooms_answer_operational_queries() {
        let rooms = registry();
        let room = rooms.resolve("P");

        let health = room.health().await.unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.project_id, "P");

        let status = room.status().await.unwrap();
        assert_eq!(status.project_id, "P");
        assert!(status.runtime.is_none());
        assert_eq!(status.pending_requests, 0);
    }
}
