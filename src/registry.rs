//! Race ID -> room owner lookup
//!
//! The registry creates each room at most once, even when several sockets
//! join the same race concurrently, and reaps rooms nobody is watching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{RaceError, RoomResult};
use crate::room::policy::StartPolicy;
use crate::room::state::RaceState;
use crate::room::{spawn_room_with, RoomContext, RoomHandle, RoomSettings};
use crate::store::RaceStore;
use crate::types::RaceId;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RaceId, RoomHandle>>,
    ctx: RoomContext,
}

impl RoomRegistry {
    pub fn new(
        store: Arc<dyn RaceStore>,
        policy: Arc<dyn StartPolicy>,
        settings: RoomSettings,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            ctx: RoomContext {
                store,
                policy,
                settings,
            },
        }
    }

    /// Live handle for `race_id`, if a room is running
    pub async fn get(&self, race_id: &str) -> Option<RoomHandle> {
        self.rooms
            .read()
            .await
            .get(race_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Existing room, or a new one seeded from the store. A race that
    /// already has a saved result comes back finished, never raceable again.
    pub async fn get_or_create(&self, race_id: &str) -> RoomResult<RoomHandle> {
        if let Some(handle) = self.get(race_id).await {
            return Ok(handle);
        }

        // Load outside the lock; a store round trip must not block other races
        let info = self
            .ctx
            .store
            .load_race(race_id)
            .await?
            .ok_or_else(|| RaceError::UnknownRoom(race_id.to_string()))?;
        let finished = self.ctx.store.load_result(race_id).await?;

        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(race_id).filter(|h| !h.is_closed()) {
            return Ok(handle.clone());
        }

        let state = match finished {
            Some(result) => {
                tracing::info!(race_id, "Reopening finished race read-only");
                RaceState::restore(info, result)
            }
            None => {
                tracing::info!(race_id, players = info.roster.len(), "Creating race room");
                RaceState::new(info)
            }
        };
        let handle = spawn_room_with(state, self.ctx.clone());
        rooms.insert(race_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Drop the room if it agrees to retire. Returns true if it is gone.
    ///
    /// The room is asked without holding the registry lock: its queue may be
    /// backed up, and other races must keep joining meanwhile.
    pub async fn remove(&self, race_id: &str) -> bool {
        let Some(handle) = self.rooms.read().await.get(race_id).cloned() else {
            return false;
        };
        if !handle.retire().await {
            return false;
        }

        let mut rooms = self.rooms.write().await;
        // A join may have replaced the entry while we waited
        if rooms.get(race_id).is_some_and(|h| h.same_room(&handle)) {
            rooms.remove(race_id);
            tracing::info!(race_id, "Race room removed");
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    pub async fn race_ids(&self) -> Vec<RaceId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// One reaper pass over every room
    pub async fn reap(&self) -> usize {
        let mut removed = 0;
        for race_id in self.race_ids().await {
            if self.remove(&race_id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            let remaining = self.len().await;
            tracing::debug!(removed, remaining, "Reaped idle race rooms");
        }
        removed
    }

    /// Periodically remove finished or abandoned rooms
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.reap().await;
            }
        })
    }
}
