use std::collections::HashSet;

use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::{MinuteSpan, Minutes, TimeBlock, TrackKey};

use super::availability::resolve_availability;
use super::batch::DateRange;
use super::conflict::find_overlap;
use super::error::EngineError;
use super::Engine;

/// A discrete bookable slot for the public booking-link flow. `visible`
/// is admin curation merged in for display; booking approval always
/// re-runs the full validator regardless of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotCandidate {
    pub teacher_id: Ulid,
    pub block: TimeBlock,
    pub booked: bool,
    pub visible: bool,
}

impl Engine {
    /// Enumerate candidates for each teacher and date: every availability
    /// slot stepped by `step_min`, keeping `start + duration` inside the
    /// slot. Read-only; runs under read locks.
    pub async fn build_slot_candidates(
        &self,
        teacher_ids: &[Ulid],
        range: &DateRange,
        duration_min: Minutes,
        step_min: Minutes,
    ) -> Result<Vec<SlotCandidate>, EngineError> {
        if duration_min == 0 || duration_min > crate::model::MINUTES_PER_DAY {
            return Err(EngineError::LimitExceeded("duration must fit within one day"));
        }
        if step_min == 0 || step_min > crate::model::MINUTES_PER_DAY {
            return Err(EngineError::LimitExceeded("step must fit within one day"));
        }
        if range.days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }

        let exclude = HashSet::new();
        let mut candidates = Vec::new();
        for &teacher_id in teacher_ids {
            let calendar = self.calendar_get(teacher_id);
            let cal_guard = match &calendar {
                Some(cal) => Some(cal.read().await),
                None => None,
            };
            let track = self.track_get(&TrackKey::Teacher(teacher_id));
            let track_guard = match &track {
                Some(track) => Some(track.read().await),
                None => None,
            };

            for date in range.iter_dates() {
                for slot in resolve_availability(cal_guard.as_deref(), date) {
                    let mut start = slot.start_min;
                    while start + duration_min <= slot.end_min {
                        let block = TimeBlock::new(date, MinuteSpan::new(start, start + duration_min));
                        let booked = track_guard
                            .as_deref()
                            .is_some_and(|t| find_overlap(t, &block, &exclude).is_some());
                        let visible = self.services.curation.is_visible(teacher_id, &block);
                        candidates.push(SlotCandidate {
                            teacher_id,
                            block,
                            booked,
                            visible,
                        });
                        if candidates.len() > MAX_SLOT_CANDIDATES {
                            return Err(EngineError::LimitExceeded("too many slot candidates"));
                        }
                        start += step_min;
                    }
                }
            }
        }
        Ok(candidates)
    }
}
