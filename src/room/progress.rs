//! Folding per-racer progress reports into room state

use super::state::RaceState;
use crate::error::{RaceError, RoomResult};
use crate::types::RaceStatus;

/// Share of challenges completed, in percent
pub fn progress_percent(challenge_index: usize, total_challenges: usize) -> f64 {
    if total_challenges == 0 {
        return 0.0;
    }
    (challenge_index as f64 / total_challenges as f64 * 100.0).clamp(0.0, 100.0)
}

pub(crate) fn validate_wpm(wpm: f64) -> RoomResult<()> {
    if !wpm.is_finite() || wpm < 0.0 {
        return Err(RaceError::invalid_input(
            "wpm",
            format!("{} is not a valid speed", wpm),
        ));
    }
    Ok(())
}

impl RaceState {
    /// Record a racer's position. Lower indices than already accepted are
    /// stale (reordered delivery) and dropped without touching state.
    pub fn apply_progress(
        &mut self,
        user_id: &str,
        challenge_index: usize,
        wpm: f64,
    ) -> RoomResult<()> {
        match self.status {
            RaceStatus::InProgress => {}
            RaceStatus::Finished => return Err(RaceError::RaceFinished),
            status => {
                return Err(RaceError::InvalidTransition {
                    action: "report progress",
                    status,
                })
            }
        }
        validate_wpm(wpm)?;

        let total = self.info.total_challenges();
        let participant = self.participant_mut(user_id)?;

        if participant.is_finished() {
            return Err(RaceError::AlreadyFinished(user_id.to_string()));
        }
        if challenge_index < participant.current_challenge_index {
            return Err(RaceError::StaleUpdate {
                reported: challenge_index,
                current: participant.current_challenge_index,
            });
        }

        let index = challenge_index.min(total);
        participant.current_challenge_index = index;
        participant.progress = progress_percent(index, total);
        participant.current_wpm = wpm;
        Ok(())
    }
}
