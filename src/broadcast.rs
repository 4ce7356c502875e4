//! Fan-out of room snapshots to bound sockets
//!
//! Every socket gets its own bounded queue. The room only ever `try_send`s,
//! so a socket that stops draining its queue is evicted instead of stalling
//! the room.

use axum::extract::ws::Utf8Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;
use crate::types::{ConnectionId, Role, UserId};

/// Serialized server message, cheap to clone across queues
pub type Frame = Utf8Bytes;

pub fn frame_channel(capacity: usize) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(capacity)
}

pub fn encode(msg: &ServerMessage) -> Option<Frame> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Frame::from(json)),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            None
        }
    }
}

#[derive(Debug)]
pub struct Subscriber {
    pub user_id: UserId,
    pub role: Role,
    tx: mpsc::Sender<Frame>,
}

impl Subscriber {
    pub fn new(user_id: UserId, role: Role, tx: mpsc::Sender<Frame>) -> Self {
        Self { user_id, role, tx }
    }
}

#[derive(Debug)]
pub struct Evicted {
    pub conn_id: ConnectionId,
    pub subscriber: Subscriber,
}

#[derive(Debug, Default)]
pub struct Broadcaster {
    subscribers: HashMap<ConnectionId, Subscriber>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, conn_id: ConnectionId, subscriber: Subscriber) {
        self.subscribers.insert(conn_id, subscriber);
    }

    pub fn unbind(&mut self, conn_id: &ConnectionId) -> Option<Subscriber> {
        self.subscribers.remove(conn_id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn spectator_count(&self) -> usize {
        self.subscribers
            .values()
            .filter(|s| s.role == Role::Spectator)
            .count()
    }

    /// Queue a frame for every bound socket. Sockets whose queue is full or
    /// closed are unbound and returned to the caller.
    pub fn broadcast(&mut self, frame: &Frame) -> Vec<Evicted> {
        let mut dropped = Vec::new();
        for (conn_id, subscriber) in &self.subscribers {
            if let Err(e) = subscriber.tx.try_send(frame.clone()) {
                tracing::warn!(
                    conn_id = %conn_id,
                    user_id = %subscriber.user_id,
                    error = %e,
                    "Evicting socket that cannot keep up"
                );
                dropped.push(conn_id.clone());
            }
        }

        dropped
            .into_iter()
            .filter_map(|conn_id| {
                self.subscribers
                    .remove(&conn_id)
                    .map(|subscriber| Evicted {
                        conn_id,
                        subscriber,
                    })
            })
            .collect()
    }
}
