//! Race lifecycle state owned by a single room task
//!
//! Nothing here is shared: the room owner holds the only `RaceState` and
//! every mutation goes through `&mut self`. Each operation validates fully
//! before touching any field so a rejected message leaves no trace.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use super::policy::LobbyView;
use super::ranking::sort_standings;
use crate::countdown::seconds_remaining;
use crate::error::{RaceError, RoomResult};
use crate::types::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub current_challenge_index: usize,
    pub progress: f64,
    pub current_wpm: f64,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_wpm: Option<f64>,
    pub final_accuracy: Option<f64>,
    pub rank: Option<u32>,
    /// Bound racer sockets for this user
    pub connections: usize,
}

impl Participant {
    fn new(entry: RosterEntry) -> Self {
        Self {
            user_id: entry.user_id,
            display_name: entry.display_name,
            current_challenge_index: 0,
            progress: 0.0,
            current_wpm: 0.0,
            finished_at: None,
            final_wpm: None,
            final_accuracy: None,
            rank: None,
            connections: 0,
        }
    }

    /// Rebuild from saved standings. Nobody is connected yet.
    fn from_view(view: ParticipantView) -> Self {
        Self {
            user_id: view.user_id,
            display_name: view.display_name,
            current_challenge_index: view.current_challenge_index,
            progress: view.progress,
            current_wpm: view.current_wpm,
            finished_at: view.finished_at.and_then(DateTime::from_timestamp_millis),
            final_wpm: view.final_wpm,
            final_accuracy: view.final_accuracy,
            rank: view.rank,
            connections: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            current_challenge_index: self.current_challenge_index,
            progress: self.progress,
            current_wpm: self.current_wpm,
            finished_at: self.finished_at.map(|t| t.timestamp_millis()),
            final_wpm: self.final_wpm,
            final_accuracy: self.final_accuracy,
            rank: self.rank,
            connected: self.connections > 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RaceState {
    pub(super) info: RaceInfo,
    pub(super) status: RaceStatus,
    pub(super) participants: Vec<Participant>,
    /// user id -> position in `participants`, keeps per-message work O(1)
    pub(super) index: HashMap<UserId, usize>,
    pub(super) start_time: Option<DateTime<Utc>>,
    pub(super) ended_at: Option<DateTime<Utc>>,
    pub(super) ranked: u32,
}

impl RaceState {
    pub fn new(info: RaceInfo) -> Self {
        let mut participants = Vec::new();
        let mut index = HashMap::new();

        for entry in info.roster.iter().cloned() {
            if index.contains_key(&entry.user_id) {
                tracing::warn!(race_id = %info.id, user_id = %entry.user_id, "Duplicate roster entry ignored");
                continue;
            }
            if participants.len() >= info.max_players {
                tracing::warn!(
                    race_id = %info.id,
                    user_id = %entry.user_id,
                    max_players = info.max_players,
                    "Roster exceeds max players, extra entry ignored"
                );
                continue;
            }
            index.insert(entry.user_id.clone(), participants.len());
            participants.push(Participant::new(entry));
        }

        Self {
            info,
            status: RaceStatus::Waiting,
            participants,
            index,
            start_time: None,
            ended_at: None,
            ranked: 0,
        }
    }

    /// A race that already finished, rebuilt from its saved result. Ranks
    /// and finish times come back exactly as saved and the status is
    /// `finished`, so nothing can be raced again.
    pub fn restore(info: RaceInfo, result: RaceResult) -> Self {
        let participants: Vec<_> = result
            .standings
            .into_iter()
            .map(Participant::from_view)
            .collect();
        let index = participants
            .iter()
            .enumerate()
            .map(|(i, p)| (p.user_id.clone(), i))
            .collect();
        let ranked = participants.iter().filter_map(|p| p.rank).max().unwrap_or(0);

        Self {
            info,
            status: RaceStatus::Finished,
            participants,
            index,
            start_time: None,
            ended_at: Some(result.finished_at),
            ranked,
        }
    }

    pub fn info(&self) -> &RaceInfo {
        &self.info
    }

    pub fn race_id(&self) -> &RaceId {
        &self.info.id
    }

    pub fn status(&self) -> RaceStatus {
        self.status
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.index.get(user_id).map(|&i| &self.participants[i])
    }

    pub(super) fn participant_mut(&mut self, user_id: &str) -> RoomResult<&mut Participant> {
        match self.index.get(user_id) {
            Some(&i) => Ok(&mut self.participants[i]),
            None => Err(RaceError::NotARacer(user_id.to_string())),
        }
    }

    pub fn is_racer(&self, user_id: &str) -> bool {
        self.index.contains_key(user_id)
    }

    /// Host of the race, or any admin
    pub fn may_command(&self, user_id: &str, admin: bool) -> bool {
        admin || self.info.host_id.as_deref() == Some(user_id)
    }

    pub fn lobby_view(&self) -> LobbyView {
        LobbyView {
            roster_size: self.participants.len(),
            connected_racers: self.participants.iter().filter(|p| p.connections > 0).count(),
            max_players: self.info.max_players,
        }
    }

    /// Bind one more racer socket. Progress is untouched: reconnecting resumes.
    pub fn attach(&mut self, user_id: &str) -> RoomResult<()> {
        let participant = self.participant_mut(user_id)?;
        participant.connections += 1;
        Ok(())
    }

    /// Unbind a racer socket. A disconnect is never a forfeit.
    pub fn detach(&mut self, user_id: &str) {
        if let Ok(participant) = self.participant_mut(user_id) {
            participant.connections = participant.connections.saturating_sub(1);
        }
    }

    fn advance(&mut self, to: RaceStatus) {
        debug_assert_eq!(self.status.next(), Some(to));
        tracing::info!(race_id = %self.info.id, from = %self.status, to = %to, "Race status changed");
        self.status = to;
    }

    /// Freeze the absolute start instant; clients derive the countdown from it
    pub fn start_countdown(
        &mut self,
        duration_seconds: u32,
        now: DateTime<Utc>,
    ) -> RoomResult<DateTime<Utc>> {
        if self.status != RaceStatus::Waiting {
            return Err(RaceError::InvalidTransition {
                action: "start the countdown",
                status: self.status,
            });
        }
        if self.participants.is_empty() {
            return Err(RaceError::invalid_input(
                "roster",
                "a race needs at least one racer",
            ));
        }

        let start_time = now + ChronoDuration::seconds(i64::from(duration_seconds));
        self.start_time = Some(start_time);
        self.advance(RaceStatus::Countdown);
        Ok(start_time)
    }

    pub fn countdown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == RaceStatus::Countdown && self.start_time.is_some_and(|t| now >= t)
    }

    /// countdown -> in_progress
    pub fn begin(&mut self) -> RoomResult<()> {
        if self.status != RaceStatus::Countdown {
            return Err(RaceError::InvalidTransition {
                action: "go live",
                status: self.status,
            });
        }
        self.advance(RaceStatus::InProgress);
        Ok(())
    }

    /// External stop (time limit, host). Unfinished racers stay unranked.
    pub fn force_end(&mut self, now: DateTime<Utc>) -> RoomResult<()> {
        match self.status {
            RaceStatus::InProgress => {
                self.finish_race(now);
                Ok(())
            }
            RaceStatus::Finished => Err(RaceError::RaceFinished),
            status => Err(RaceError::InvalidTransition {
                action: "end the race",
                status,
            }),
        }
    }

    pub(super) fn finish_race(&mut self, now: DateTime<Utc>) {
        self.ended_at = Some(now);
        self.advance(RaceStatus::Finished);
    }

    pub fn all_finished(&self) -> bool {
        !self.participants.is_empty() && self.participants.iter().all(Participant::is_finished)
    }

    fn countdown_value(&self, now: DateTime<Utc>) -> Option<u32> {
        if self.status != RaceStatus::Countdown {
            return None;
        }
        let remaining_ms = (self.start_time? - now).num_milliseconds();
        Some(seconds_remaining(remaining_ms))
    }

    pub fn snapshot(&self, spectator_count: usize, now: DateTime<Utc>) -> RaceStateSnapshot {
        let mut participants: Vec<_> = self.participants.iter().map(Participant::view).collect();
        sort_standings(&mut participants);

        RaceStateSnapshot {
            race_id: self.info.id.clone(),
            status: self.status,
            participants,
            spectator_count,
            challenge_count: self.info.total_challenges(),
            countdown_value: self.countdown_value(now),
            start_time: self.start_time.map(|t| t.timestamp_millis()),
            server_now: now.timestamp_millis(),
        }
    }

    /// Final standings, once the race is over
    pub fn result(&self) -> Option<RaceResult> {
        let finished_at = self.ended_at?;
        let mut standings: Vec<_> = self.participants.iter().map(Participant::view).collect();
        sort_standings(&mut standings);
        Some(RaceResult {
            race_id: self.info.id.clone(),
            category: self.info.category.clone(),
            finished_at,
            standings,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_race(racers: &[&str], challenges: usize) -> RaceInfo {
    RaceInfo {
        id: "race-1".to_string(),
        category: "rust".to_string(),
        challenge_ids: (0..challenges).map(|i| format!("c{}", i)).collect(),
        max_players: 4,
        created_at: Utc::now(),
        host_id: Some("host".to_string()),
        roster: racers
            .iter()
            .map(|id| RosterEntry {
                user_id: id.to_string(),
                display_name: id.to_uppercase(),
            })
            .collect(),
        time_limit_seconds: None,
    }
}

/// A race already in progress
#[cfg(test)]
pub(crate) fn live_race(racers: &[&str], challenges: usize) -> RaceState {
    let mut state = RaceState::new(test_race(racers, challenges));
    let now = Utc::now();
    state.start_countdown(3, now).unwrap();
    state.begin().unwrap();
    state
}
