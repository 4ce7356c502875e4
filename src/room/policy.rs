//! Pluggable rules for leaving the `waiting` state
//!
//! The room never decides on its own when a lobby is ready; it asks the
//! configured policy every time the lobby changes while still `waiting`.

use std::fmt;

/// What a policy gets to look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobbyView {
    pub roster_size: usize,
    pub connected_racers: usize,
    pub max_players: usize,
}

pub trait StartPolicy: Send + Sync + fmt::Debug {
    /// Countdown length in seconds if the race should start now
    fn auto_start(&self, lobby: &LobbyView) -> Option<u32>;
}

/// Only an explicit `startCountdown` starts the race
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTriggered;

impl StartPolicy for HostTriggered {
    fn auto_start(&self, _lobby: &LobbyView) -> Option<u32> {
        None
    }
}

/// Start once enough racers are connected (or the lobby is full)
#[derive(Debug, Clone, Copy)]
pub struct AutoStart {
    pub min_racers: usize,
    pub countdown_seconds: u32,
}

impl StartPolicy for AutoStart {
    fn auto_start(&self, lobby: &LobbyView) -> Option<u32> {
        let needed = self.min_racers.min(lobby.max_players).max(1);
        (lobby.connected_racers >= needed).then_some(self.countdown_seconds)
    }
}
