//! Errors surfaced by race rooms and the connection gateway

use crate::types::{RaceId, RaceStatus, UserId};

pub type RoomResult<T> = Result<T, RaceError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RaceError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Cannot {action} while race is {status}")]
    InvalidTransition {
        action: &'static str,
        status: RaceStatus,
    },

    #[error("Race {0} not found")]
    UnknownRoom(RaceId),

    #[error("Stale progress update: challenge {reported} is behind {current}")]
    StaleUpdate { reported: usize, current: usize },

    #[error("Race is already finished")]
    RaceFinished,

    #[error("Participant {0} already finished")]
    AlreadyFinished(UserId),

    #[error("User {0} is not a racer in this race")]
    NotARacer(UserId),

    #[error("Only the race host can {0}")]
    Forbidden(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidInput {
        field: &'static str,
        reason: String,
    },

    #[error("Join a race first")]
    NotJoined,

    #[error("Already joined race {0}")]
    AlreadyJoined(RaceId),

    #[error("Race room is shutting down")]
    RoomClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RaceError {
    /// Stable machine-readable code sent in `race:error`
    pub fn code(&self) -> &'static str {
        match self {
            RaceError::Unauthorized => "UNAUTHORIZED",
            RaceError::InvalidTransition { .. } => "INVALID_TRANSITION",
            RaceError::UnknownRoom(_) => "UNKNOWN_ROOM",
            RaceError::StaleUpdate { .. } => "STALE_UPDATE",
            RaceError::RaceFinished => "RACE_FINISHED",
            RaceError::AlreadyFinished(_) => "ALREADY_FINISHED",
            RaceError::NotARacer(_) => "NOT_A_RACER",
            RaceError::Forbidden(_) => "FORBIDDEN",
            RaceError::InvalidInput { .. } => "INVALID_INPUT",
            RaceError::NotJoined => "NOT_JOINED",
            RaceError::AlreadyJoined(_) => "ALREADY_JOINED",
            RaceError::RoomClosed => "ROOM_CLOSED",
            RaceError::Internal(_) => "INTERNAL",
        }
    }

    /// Silent errors are logged and dropped; the client never hears about them
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            RaceError::StaleUpdate { .. } | RaceError::RaceFinished | RaceError::AlreadyFinished(_)
        )
    }

    pub fn invalid_input(field: &'static str, reason: impl Into<String>) -> Self {
        RaceError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from the race store collaborator
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read race data: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse race data: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<StoreError> for RaceError {
    fn from(e: StoreError) -> Self {
        RaceError::Internal(e.to_string())
    }
}
