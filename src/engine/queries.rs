use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::resolve_availability;
use super::batch::DateRange;
use super::conflict::{find_all_overlaps, find_room_overlaps, SweepEvent};
use super::error::EngineError;
use super::Engine;

fn sweep_event(entry: &TrackEntry) -> SweepEvent {
    SweepEvent {
        id: entry.booking_id,
        start_at: entry.block.start_at(),
        end_at: entry.block.end_at(),
    }
}

fn in_range(entry: &TrackEntry, range: &DateRange) -> bool {
    entry.block.date >= range.from && entry.block.date <= range.to
}

impl Engine {
    /// The authoritative free slots for a teacher on one date. Empty
    /// means "no availability that day": a hard rejection for callers,
    /// not an error.
    pub async fn resolve_availability_for(
        &self,
        teacher_id: Ulid,
        date: NaiveDate,
    ) -> Vec<MinuteSpan> {
        let calendar = self.calendar_get(teacher_id);
        let guard = match &calendar {
            Some(cal) => Some(cal.read().await),
            None => None,
        };
        resolve_availability(guard.as_deref(), date)
    }

    pub fn session(&self, id: Ulid) -> Option<Session> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    pub fn appointment(&self, id: Ulid) -> Option<Appointment> {
        self.appointments.get(&id).map(|e| e.value().clone())
    }

    /// All sessions of a class, ordered by start.
    pub fn sessions_for_class(&self, class_id: Ulid) -> Vec<Session> {
        let Some(ids) = self.class_sessions.get(&class_id) else {
            return Vec::new();
        };
        let mut sessions: Vec<Session> = ids
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|e| e.value().clone()))
            .collect();
        sessions.sort_by_key(|s| s.block);
        sessions
    }

    /// A teacher's committed bookings (sessions and appointments) in a
    /// date window, ordered by start.
    pub async fn teacher_schedule(&self, teacher_id: Ulid, range: &DateRange) -> Vec<TrackEntry> {
        let Some(track) = self.track_get(&TrackKey::Teacher(teacher_id)) else {
            return Vec::new();
        };
        let guard = track.read().await;
        guard
            .entries
            .iter()
            .filter(|e| in_range(e, range))
            .cloned()
            .collect()
    }

    /// The teacher-change audit trail, optionally filtered to one session.
    pub fn audit_log(&self, session_id: Option<Ulid>) -> Vec<TeacherChange> {
        let audit = self.audit.read().expect("audit lock poisoned");
        match session_id {
            Some(id) => audit.iter().filter(|c| c.session_id == id).cloned().collect(),
            None => audit.clone(),
        }
    }

    // ── Dashboard conflict views (advisory, read-only) ───

    /// Pairwise conflicts on one teacher's bookings in a window.
    pub async fn teacher_conflicts(
        &self,
        teacher_id: Ulid,
        range: &DateRange,
    ) -> Result<HashMap<Ulid, HashSet<Ulid>>, EngineError> {
        if range.days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        let Some(track) = self.track_get(&TrackKey::Teacher(teacher_id)) else {
            return Ok(HashMap::new());
        };
        let guard = track.read().await;
        let events: Vec<SweepEvent> = guard
            .entries
            .iter()
            .filter(|e| in_range(e, range))
            .map(sweep_event)
            .collect();
        Ok(find_all_overlaps(&events))
    }

    /// Campus-wide pairwise room conflicts in a window, grouped per room.
    pub async fn campus_conflicts(
        &self,
        campus_id: Ulid,
        range: &DateRange,
    ) -> Result<HashMap<Ulid, HashSet<Ulid>>, EngineError> {
        if range.days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        let room_tracks: Vec<(Ulid, super::SharedTrack)> = self
            .track_snapshot()
            .into_iter()
            .filter_map(|(key, track)| match key {
                TrackKey::Room(room_id) => Some((room_id, track)),
                TrackKey::Teacher(_) => None,
            })
            .filter(|(room_id, _)| {
                self.services
                    .directory
                    .room(*room_id)
                    .is_some_and(|r| r.campus_id == campus_id)
            })
            .collect();

        let mut events: Vec<(Option<Ulid>, SweepEvent)> = Vec::new();
        for (room_id, track) in room_tracks {
            let guard = track.read().await;
            for entry in guard.entries.iter().filter(|e| in_range(e, range)) {
                events.push((Some(room_id), sweep_event(entry)));
            }
        }
        Ok(find_room_overlaps(&events))
    }

    // ── Administrative cascade guards ────────────────────

    /// True when the room still has bookings at or after "now". The
    /// record-store collaborator must not delete a room while this holds
    /// (or must null the room on its sessions first).
    pub async fn room_in_use(&self, room_id: Ulid) -> bool {
        self.track_in_use(TrackKey::Room(room_id)).await
    }

    /// Same contract for teacher deletion.
    pub async fn teacher_in_use(&self, teacher_id: Ulid) -> bool {
        self.track_in_use(TrackKey::Teacher(teacher_id)).await
    }

    async fn track_in_use(&self, key: TrackKey) -> bool {
        let Some(track) = self.track_get(&key) else {
            return false;
        };
        let now = self.services.clock.now();
        let guard = track.read().await;
        guard.entries.iter().any(|e| e.block.start_at() >= now)
    }
}
