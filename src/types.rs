use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types for type safety
pub type RaceId = String;
pub type UserId = String;
pub type ChallengeId = String;
pub type CategoryId = String;

/// Identifies one bound socket. A racer may hold several (tabs, reconnects).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Race lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Waiting,
    Countdown,
    InProgress,
    Finished,
}

impl RaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Waiting => "waiting",
            RaceStatus::Countdown => "countdown",
            RaceStatus::InProgress => "in_progress",
            RaceStatus::Finished => "finished",
        }
    }

    /// The single legal successor, if any
    pub fn next(&self) -> Option<RaceStatus> {
        match self {
            RaceStatus::Waiting => Some(RaceStatus::Countdown),
            RaceStatus::Countdown => Some(RaceStatus::InProgress),
            RaceStatus::InProgress => Some(RaceStatus::Finished),
            RaceStatus::Finished => None,
        }
    }
}

impl fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Racer,
    Spectator,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: UserId,
    pub display_name: String,
}

/// Race metadata as served by the HTTP layer before a socket attaches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RaceInfo {
    pub id: RaceId,
    pub category: CategoryId,
    pub challenge_ids: Vec<ChallengeId>,
    pub max_players: usize,
    pub created_at: DateTime<Utc>,
    /// User allowed to issue privileged commands besides admins
    #[serde(default)]
    pub host_id: Option<UserId>,
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
    /// Force-end the race this long after it goes live
    #[serde(default)]
    pub time_limit_seconds: Option<u32>,
}

impl RaceInfo {
    pub fn total_challenges(&self) -> usize {
        self.challenge_ids.len()
    }
}

/// Denormalized participant projection carried in every snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user_id: UserId,
    pub display_name: String,
    pub current_challenge_index: usize,
    pub progress: f64,
    pub current_wpm: f64,
    /// Epoch milliseconds
    pub finished_at: Option<i64>,
    pub final_wpm: Option<f64>,
    pub final_accuracy: Option<f64>,
    pub rank: Option<u32>,
    pub connected: bool,
}

/// Full room state as sent to every bound socket. Replaces the previous one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RaceStateSnapshot {
    pub race_id: RaceId,
    pub status: RaceStatus,
    pub participants: Vec<ParticipantView>,
    pub spectator_count: usize,
    pub challenge_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_value: Option<u32>,
    /// Epoch milliseconds at which the race goes live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Server clock at snapshot creation (epoch ms), used for client clock sync
    pub server_now: i64,
}

/// Final standings handed to the race store once a race finishes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RaceResult {
    pub race_id: RaceId,
    pub category: CategoryId,
    pub finished_at: DateTime<Utc>,
    pub standings: Vec<ParticipantView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        let mut status = RaceStatus::Waiting;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            assert!(next > status);
            status = next;
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![
                RaceStatus::Waiting,
                RaceStatus::Countdown,
                RaceStatus::InProgress,
                RaceStatus::Finished
            ]
        );
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&RaceStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(RaceStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_race_info_defaults_optional_fields() {
        let json = r#"{
            "id": "r1",
            "category": "python",
            "challengeIds": ["c1", "c2"],
            "maxPlayers": 4,
            "createdAt": "2026-01-01T00:00:00Z"
        }"#;
        let info: RaceInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.total_challenges(), 2);
        assert!(info.roster.is_empty());
        assert!(info.host_id.is_none());
        assert!(info.time_limit_seconds.is_none());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
