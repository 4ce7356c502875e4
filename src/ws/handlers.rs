//! Per-connection message dispatch
//!
//! A `Session` belongs to one socket. It knows who is on the other end and
//! which room (if any) the socket is bound to, and turns client messages into
//! room commands. Replies are only sent for errors; state changes reach the
//! client through the room's broadcast like everyone else's.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::broadcast::{frame_channel, Frame};
use crate::error::{RaceError, RoomResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::RoomHandle;
use crate::state::AppState;
use crate::types::{ConnectionId, RaceId, Role};

/// Bound socket. Dropping it unbinds from the room.
#[derive(Debug)]
struct Binding {
    room: RoomHandle,
    conn_id: ConnectionId,
    role: Role,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.room.unsubscribe(self.conn_id.clone());
    }
}

pub struct Session {
    identity: Identity,
    conn_id: ConnectionId,
    state: Arc<AppState>,
    binding: Option<Binding>,
    outbound: Option<mpsc::Receiver<Frame>>,
}

impl Session {
    pub fn new(identity: Identity, state: Arc<AppState>) -> Self {
        Self {
            identity,
            conn_id: ConnectionId::new(),
            state,
            binding: None,
            outbound: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn race_id(&self) -> Option<&RaceId> {
        self.binding.as_ref().map(|b| b.room.race_id())
    }

    pub fn role(&self) -> Option<Role> {
        self.binding.as_ref().map(|b| b.role)
    }

    /// Frames the room pushes to this socket; available once after joining
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.outbound.take()
    }

    /// Handle a client message and return an optional direct reply
    pub async fn handle_message(&mut self, msg: ClientMessage) -> Option<ServerMessage> {
        let result = match msg {
            ClientMessage::Join { race_id, role } => self.join(race_id, role).await,

            ClientMessage::Progress {
                challenge_index,
                wpm,
            } => match self.racer_room() {
                Ok(room) => {
                    room.progress(self.identity.user_id.clone(), challenge_index, wpm)
                        .await
                }
                Err(e) => Err(e),
            },

            ClientMessage::Finish { wpm, accuracy } => match self.racer_room() {
                Ok(room) => room
                    .finish(self.identity.user_id.clone(), wpm, accuracy)
                    .await
                    .map(|outcome| {
                        tracing::debug!(user_id = %self.identity.user_id, rank = outcome.rank, "Finish acknowledged");
                    }),
                Err(e) => Err(e),
            },

            // Privileges are checked by the room, which knows the host
            ClientMessage::StartCountdown { duration_seconds } => match self.room() {
                Ok(room) => {
                    room.start_countdown(self.identity.clone(), duration_seconds)
                        .await
                }
                Err(e) => Err(e),
            },

            ClientMessage::ForceEnd => match self.room() {
                Ok(room) => room.force_end(self.identity.clone()).await,
                Err(e) => Err(e),
            },
        };

        self.respond(result)
    }

    fn room(&self) -> RoomResult<RoomHandle> {
        self.binding
            .as_ref()
            .map(|b| b.room.clone())
            .ok_or(RaceError::NotJoined)
    }

    fn racer_room(&self) -> RoomResult<RoomHandle> {
        let binding = self.binding.as_ref().ok_or(RaceError::NotJoined)?;
        if binding.role != Role::Racer {
            return Err(RaceError::NotARacer(self.identity.user_id.clone()));
        }
        Ok(binding.room.clone())
    }

    async fn join(&mut self, race_id: RaceId, requested: Role) -> RoomResult<()> {
        if let Some(current) = self.race_id() {
            return Err(RaceError::AlreadyJoined(current.clone()));
        }

        // A room can retire between lookup and subscribe; one retry picks up
        // the fresh room the registry creates.
        let mut retried = false;
        loop {
            let room = self.state.registry.get_or_create(&race_id).await?;
            let (tx, rx) = frame_channel(self.state.config.send_queue_capacity);
            match room
                .subscribe(self.conn_id.clone(), self.identity.clone(), requested, tx)
                .await
            {
                Ok(role) => {
                    tracing::info!(
                        race_id = %race_id,
                        user_id = %self.identity.user_id,
                        ?role,
                        "Joined race"
                    );
                    self.binding = Some(Binding {
                        room,
                        conn_id: self.conn_id.clone(),
                        role,
                    });
                    self.outbound = Some(rx);
                    return Ok(());
                }
                Err(RaceError::RoomClosed) if !retried => {
                    tracing::debug!(race_id = %race_id, "Room closed during join, retrying");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn respond(&self, result: RoomResult<()>) -> Option<ServerMessage> {
        match result {
            Ok(()) => None,
            Err(e) if e.is_silent() => {
                tracing::debug!(user_id = %self.identity.user_id, "Dropped message: {}", e);
                None
            }
            Err(e) => {
                tracing::info!(user_id = %self.identity.user_id, code = e.code(), "Rejected message: {}", e);
                Some(ServerMessage::from(&e))
            }
        }
    }
}
