//! Finish handling and standings order
//!
//! Ranks are handed out strictly in the order finish events reach the room
//! owner. Speed and accuracy never reorder finishers.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use super::progress::validate_wpm;
use super::state::RaceState;
use crate::error::{RaceError, RoomResult};
use crate::types::{ParticipantView, RaceStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinishOutcome {
    pub rank: u32,
    /// This finish completed the field and ended the race
    pub race_finished: bool,
}

impl RaceState {
    pub fn record_finish(
        &mut self,
        user_id: &str,
        wpm: f64,
        accuracy: f64,
        now: DateTime<Utc>,
    ) -> RoomResult<FinishOutcome> {
        match self.status {
            RaceStatus::InProgress => {}
            RaceStatus::Finished => return Err(RaceError::RaceFinished),
            status => {
                return Err(RaceError::InvalidTransition {
                    action: "finish",
                    status,
                })
            }
        }
        validate_wpm(wpm)?;
        if !accuracy.is_finite() || !(0.0..=100.0).contains(&accuracy) {
            return Err(RaceError::invalid_input(
                "accuracy",
                format!("{} is not a percentage", accuracy),
            ));
        }

        let total = self.info.total_challenges();
        let next_rank = self.ranked + 1;
        let participant = self.participant_mut(user_id)?;

        if participant.is_finished() {
            return Err(RaceError::AlreadyFinished(user_id.to_string()));
        }
        if participant.current_challenge_index + 1 < total {
            return Err(RaceError::invalid_input(
                "finish",
                format!(
                    "still on challenge {} of {}",
                    participant.current_challenge_index + 1,
                    total
                ),
            ));
        }

        participant.current_challenge_index = total;
        participant.progress = 100.0;
        participant.current_wpm = wpm;
        participant.final_wpm = Some(wpm);
        participant.final_accuracy = Some(accuracy);
        participant.finished_at = Some(now);
        participant.rank = Some(next_rank);
        self.ranked = next_rank;

        tracing::info!(race_id = %self.info.id, user_id, rank = next_rank, wpm, accuracy, "Racer finished");

        let race_finished = self.all_finished();
        if race_finished {
            self.finish_race(now);
        }

        Ok(FinishOutcome {
            rank: next_rank,
            race_finished,
        })
    }
}

/// Finished racers first by rank, then everyone else by progress descending.
/// Equal progress keeps the incoming (roster) order.
pub fn standings_order(a: &ParticipantView, b: &ParticipantView) -> Ordering {
    match (a.rank, b.rank) {
        (Some(ra), Some(rb)) => ra.cmp(&rb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.progress.total_cmp(&a.progress),
    }
}

pub fn sort_standings(participants: &mut [ParticipantView]) {
    participants.sort_by(standings_order);
}
