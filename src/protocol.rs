use crate::error::RaceError;
use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Join {
        race_id: RaceId,
        /// Requested role; non-participants are always bound as spectators
        #[serde(default = "default_role")]
        role: Role,
    },
    Progress {
        challenge_index: usize,
        wpm: f64,
    },
    Finish {
        wpm: f64,
        accuracy: f64,
    },
    /// Privileged: host or admin only
    StartCountdown {
        duration_seconds: u32,
    },
    /// Privileged: ends an in-progress race immediately
    ForceEnd,
}

fn default_role() -> Role {
    Role::Racer
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "race:state")]
    RaceState(RaceStateSnapshot),
    #[serde(rename = "race:error")]
    RaceError { code: String, message: String },
}

impl ServerMessage {
    pub fn parse_error(e: &serde_json::Error) -> Self {
        ServerMessage::RaceError {
            code: "PARSE_ERROR".to_string(),
            message: format!("Invalid message format: {}", e),
        }
    }
}

impl From<&RaceError> for ServerMessage {
    fn from(e: &RaceError) -> Self {
        ServerMessage::RaceError {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}
