#![forbid(unsafe_code)]

// Room registry: process-wide map from room id to room

use super::{Room, RoomError, RoomResult};
use crate::media::config::MediaConfig;
use crate::media::WorkerPool;
use crate::metrics::ServerMetrics;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tracing::{debug, info, warn};

/// Owns every live room. Rooms are created explicitly and removed when their
/// last peer leaves.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<Room>>>,
    worker_pool: Arc<WorkerPool>,
    config: Arc<MediaConfig>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(worker_pool: Arc<WorkerPool>, config: MediaConfig, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            worker_pool,
            config: Arc::new(config),
            metrics,
        }
    }

    /// Creates a room on the next worker in round-robin order.
    ///
    /// # Errors
    /// `RoomAlreadyExists` if the id is taken, `WorkerFailure` if the selected
    /// worker is dead, or `Engine` if the router cannot be created
    pub async fn create_room(&self, room_id: &str) -> RoomResult<Arc<Room>> {
        if self.contains(room_id) {
            return Err(RoomError::RoomAlreadyExists(room_id.to_string()));
        }

        let worker = self
            .worker_pool
            .acquire_worker()
            .map_err(|e| RoomError::WorkerFailure(e.to_string()))?;
        let router = crate::media::with_timeout(
            self.config.request_timeout,
            worker.create_router(&self.config.router_config),
        )
        .await?;

        let room = Arc::new(Room::new(
            room_id.to_string(),
            worker.index(),
            worker.pid(),
            router,
            self.config.clone(),
        ));

        let inserted = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(room_id) {
                false
            } else {
                rooms.insert(room_id.to_string(), room.clone());
                true
            }
        };
        if !inserted {
            // Lost a race with a concurrent create of the same id
            room.release_router().await;
            return Err(RoomError::RoomAlreadyExists(room_id.to_string()));
        }

        self.metrics.inc_rooms_created();
        info!(
            "Created room {} on worker {} (pid {})",
            room_id,
            worker.index(),
            worker.pid()
        );
        Ok(room)
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    /// # Errors
    /// `RoomNotFound` if no such room exists
    pub fn require(&self, room_id: &str) -> RoomResult<Arc<Room>> {
        self.get(room_id)
            .ok_or_else(|| RoomError::RoomNotFound(room_id.to_string()))
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(room_id)
    }

    /// Removes the room if nobody is in it and releases its router.
    /// Returns whether the room was removed.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let empty = rooms.get(room_id).is_some_and(|room| room.close_if_empty());
            if empty {
                rooms.remove(room_id)
            } else {
                None
            }
        };

        match removed {
            Some(room) => {
                room.release_router().await;
                self.metrics.inc_rooms_removed();
                info!("Removed empty room {}", room_id);
                true
            }
            None => {
                debug!("Room {} not removed (missing or occupied)", room_id);
                false
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Peers across all rooms
    pub fn peer_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        rooms.iter().map(|r| r.peer_count()).sum()
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    /// Closes every room. Used on graceful shutdown.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().map(|(_, r)| r).collect()
        };
        if rooms.is_empty() {
            return;
        }

        warn!("Shutting down {} rooms", rooms.len());
        for room in rooms {
            room.close().await;
        }
    }
}
