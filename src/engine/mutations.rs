use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime, Weekday};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{EngineError, Rejection};
use super::validate::{check_interval, BookingCandidate};
use super::{Engine, TrackWrites};

/// How far a teacher replacement reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignScope {
    /// This session only.
    Single,
    /// Every session of the same class starting at or after this one.
    Future,
}

fn sorted_keys(mut keys: Vec<TrackKey>) -> Vec<TrackKey> {
    keys.sort();
    keys.dedup();
    keys
}

fn slot_ok(span: &MinuteSpan) -> Result<(), EngineError> {
    if span.start_min >= span.end_min || span.end_min > MINUTES_PER_DAY {
        return Err(EngineError::LimitExceeded(
            "slot must be a non-empty window within one day",
        ));
    }
    Ok(())
}

impl Engine {
    /// Lock a booking's tracks (plus `extra`), re-reading the reverse
    /// index under the locks so a concurrent move can't leave us holding
    /// the wrong tracks.
    async fn lock_booking(&self, booking_id: Ulid, extra: &[TrackKey]) -> (Vec<TrackKey>, TrackWrites) {
        loop {
            let mut keys: Vec<TrackKey> = self
                .booking_tracks
                .get(&booking_id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            keys.extend_from_slice(extra);
            let keys = sorted_keys(keys);

            let tracks = self.write_tracks(&keys).await;

            let mut current: Vec<TrackKey> = self
                .booking_tracks
                .get(&booking_id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            current.extend_from_slice(extra);
            if sorted_keys(current) == keys {
                return (keys, tracks);
            }
            // Raced with a concurrent reassignment; retry with fresh keys.
        }
    }

    // ── Sessions ─────────────────────────────────────────

    /// Validate and commit one session. The checks re-run against the
    /// write-locked tracks, so two racing requests for the same slot
    /// cannot both pass.
    pub async fn create_session(&self, candidate: &BookingCandidate) -> Result<Session, EngineError> {
        metrics::counter!(crate::observability::VALIDATIONS_TOTAL).increment(1);
        let block =
            check_interval(candidate.start_at, candidate.end_at).map_err(|r| self.reject(r))?;
        let refs = self
            .resolve_refs(candidate.class_id, None)
            .map_err(|r| self.reject(r))?;

        let keys = refs.track_keys();
        let mut tracks = self.write_tracks(&keys).await;
        let calendar = self.calendar_get(refs.teacher.id);
        let cal_guard = match &calendar {
            Some(cal) => Some(cal.read().await),
            None => None,
        };

        let teacher_key = TrackKey::Teacher(refs.teacher.id);
        let room_key = refs.room.as_ref().map(|r| TrackKey::Room(r.id));
        self.run_booking_checks(
            &refs,
            &block,
            candidate.student_id,
            tracks.get(&teacher_key),
            room_key.and_then(|k| tracks.get(&k)),
            cal_guard.as_deref(),
            &HashSet::new(),
        )
        .map_err(|r| self.reject(r))?;

        let session = Session {
            id: Ulid::new(),
            class_id: refs.class.id,
            block,
            teacher_id: None,
            // Ignored for group classes.
            student_id: if refs.class.is_one_on_one() {
                candidate.student_id
            } else {
                None
            },
        };
        let event = Event::SessionCreated {
            session: session.clone(),
            effective_teacher_id: refs.teacher.id,
            room_id: refs.class.room_id,
        };
        self.wal_append(&event).await?;
        self.apply_booking_event(&event, &mut tracks);
        self.feed.publish(refs.teacher.id, &event);
        metrics::counter!(crate::observability::SESSIONS_CREATED_TOTAL).increment(1);
        tracing::info!(session = %session.id, class = %refs.class.id, %block, "session created");
        Ok(session)
    }

    /// Cancel a session, reversing any package-minute deductions through
    /// the ledger inside the same locked commit.
    pub async fn cancel_session(&self, session_id: Ulid) -> Result<(), EngineError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(self.reject(Rejection::NotFound {
                kind: "session",
                id: session_id,
            }));
        }
        let (keys, mut tracks) = self.lock_booking(session_id, &[]).await;
        // Re-check under the locks: a racing cancel may have won.
        if !self.sessions.contains_key(&session_id) {
            return Err(self.reject(Rejection::NotFound {
                kind: "session",
                id: session_id,
            }));
        }

        self.services.ledger.reverse_deduction(session_id);

        let event = Event::SessionCancelled { id: session_id };
        self.wal_append(&event).await?;
        self.apply_booking_event(&event, &mut tracks);
        for key in &keys {
            if let TrackKey::Teacher(teacher_id) = key {
                self.feed.publish(*teacher_id, &event);
            }
        }
        metrics::counter!(crate::observability::SESSIONS_CANCELLED_TOTAL).increment(1);
        tracing::info!(session = %session_id, "session cancelled");
        Ok(())
    }

    // ── Teacher replacement ──────────────────────────────

    /// Replace a session's effective teacher. `Future` scope reassigns
    /// every session of the class from this one onward, all-or-nothing:
    /// one failing occurrence rejects the whole operation. One audit row
    /// is written per session whose effective teacher actually changes.
    pub async fn replace_teacher(
        &self,
        session_id: Ulid,
        new_teacher_id: Ulid,
        scope: ReassignScope,
        reason: Option<String>,
    ) -> Result<usize, EngineError> {
        if reason.as_deref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let anchor = self
            .sessions
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                self.reject(Rejection::NotFound {
                    kind: "session",
                    id: session_id,
                })
            })?;
        let refs = self
            .resolve_refs(anchor.class_id, Some(new_teacher_id))
            .map_err(|r| self.reject(r))?;

        // Lock phase: collect targets and their tracks, then re-collect
        // under the locks until stable.
        let (targets, mut tracks) = loop {
            let targets = self.reassign_targets(&anchor, scope);
            let keys = self.reassign_keys(&targets, new_teacher_id);
            let tracks = self.write_tracks(&keys).await;
            let recheck = self.reassign_targets(&anchor, scope);
            if self.reassign_keys(&recheck, new_teacher_id) == keys {
                break (recheck, tracks);
            }
        };
        if targets.is_empty() {
            return Err(self.reject(Rejection::NotFound {
                kind: "session",
                id: session_id,
            }));
        }

        let calendar = self.calendar_get(new_teacher_id);
        let cal_guard = match &calendar {
            Some(cal) => Some(cal.read().await),
            None => None,
        };
        let target_ids: HashSet<Ulid> = targets.iter().map(|s| s.id).collect();
        let teacher_key = TrackKey::Teacher(new_teacher_id);
        let room_key = refs.room.as_ref().map(|r| TrackKey::Room(r.id));

        for target in &targets {
            self.run_reassignment_checks(
                &refs,
                &target.block,
                tracks.get(&teacher_key),
                room_key.and_then(|k| tracks.get(&k)),
                cal_guard.as_deref(),
                &target_ids,
            )
            .map_err(|r| self.reject_occurrence(target.block, r))?;
        }
        // Targets must not collide with each other once they share the
        // new teacher.
        for i in 0..targets.len() {
            for j in (i + 1)..targets.len() {
                if targets[i].block.overlaps(&targets[j].block) {
                    return Err(self.reject_occurrence(
                        targets[j].block,
                        Rejection::Duplicate {
                            session_id: targets[i].id,
                        },
                    ));
                }
            }
        }

        let stored_override = if new_teacher_id == refs.class.teacher_id {
            // Back to the class default.
            None
        } else {
            Some(new_teacher_id)
        };
        let now = self.services.clock.now();
        // (old teacher, session move, audit row) per actually-changed target.
        let mut changes = Vec::new();
        for target in &targets {
            let Some(from_teacher_id) = self.effective_teacher_of(target.id) else {
                continue;
            };
            if from_teacher_id == new_teacher_id {
                continue; // already taught by the new teacher
            }
            let set_event = Event::SessionTeacherSet {
                session_id: target.id,
                stored_override,
                effective_teacher_id: new_teacher_id,
            };
            let audit_event = Event::TeacherChangeRecorded {
                change: TeacherChange {
                    id: Ulid::new(),
                    session_id: target.id,
                    from_teacher_id,
                    to_teacher_id: new_teacher_id,
                    reason: reason.clone(),
                    changed_at: now,
                },
            };
            changes.push((from_teacher_id, set_event, audit_event));
        }
        if changes.is_empty() {
            return Ok(0);
        }

        let events: Vec<Event> = changes
            .iter()
            .flat_map(|(_, set, audit)| [set.clone(), audit.clone()])
            .collect();
        self.wal_append_batch(&events).await?;
        for (from_teacher_id, set_event, audit_event) in &changes {
            self.apply_booking_event(set_event, &mut tracks);
            self.apply_booking_event(audit_event, &mut tracks);
            self.feed.publish(new_teacher_id, set_event);
            self.feed.publish(*from_teacher_id, set_event);
        }
        metrics::counter!(crate::observability::REASSIGNMENTS_TOTAL).increment(1);
        let changed = changes.len();
        tracing::info!(
            session = %session_id,
            new_teacher = %new_teacher_id,
            ?scope,
            changed,
            "teacher replaced"
        );
        Ok(changed)
    }

    fn reassign_targets(&self, anchor: &Session, scope: ReassignScope) -> Vec<Session> {
        match scope {
            ReassignScope::Single => self
                .sessions
                .get(&anchor.id)
                .map(|e| vec![e.value().clone()])
                .unwrap_or_default(),
            ReassignScope::Future => {
                let Some(ids) = self.class_sessions.get(&anchor.class_id) else {
                    return Vec::new();
                };
                let anchor_start = (anchor.block.date, anchor.block.span.start_min);
                let mut targets: Vec<Session> = ids
                    .iter()
                    .filter_map(|id| self.sessions.get(id).map(|s| s.value().clone()))
                    .filter(|s| (s.block.date, s.block.span.start_min) >= anchor_start)
                    .collect();
                targets.sort_by_key(|s| s.block);
                targets
            }
        }
    }

    fn reassign_keys(&self, targets: &[Session], new_teacher_id: Ulid) -> Vec<TrackKey> {
        let mut keys = vec![TrackKey::Teacher(new_teacher_id)];
        for target in targets {
            if let Some(entry) = self.booking_tracks.get(&target.id) {
                keys.extend_from_slice(entry.value());
            }
        }
        sorted_keys(keys)
    }

    /// A session's effective teacher, read from the reverse track index.
    fn effective_teacher_of(&self, session_id: Ulid) -> Option<Ulid> {
        self.booking_tracks.get(&session_id)?.iter().find_map(|k| match k {
            TrackKey::Teacher(id) => Some(*id),
            TrackKey::Room(_) => None,
        })
    }

    // ── Appointments ─────────────────────────────────────

    /// Create an ad-hoc teacher/student block. No class, so only the
    /// interval, availability, and teacher-overlap checks apply.
    pub async fn create_appointment(
        &self,
        teacher_id: Ulid,
        student_id: Ulid,
        start_at: NaiveDateTime,
        end_at: NaiveDateTime,
    ) -> Result<Appointment, EngineError> {
        metrics::counter!(crate::observability::VALIDATIONS_TOTAL).increment(1);
        let block = check_interval(start_at, end_at).map_err(|r| self.reject(r))?;
        if self.services.directory.teacher(teacher_id).is_none() {
            return Err(self.reject(Rejection::NotFound {
                kind: "teacher",
                id: teacher_id,
            }));
        }

        let key = TrackKey::Teacher(teacher_id);
        let mut tracks = self.write_tracks(&[key]).await;
        let calendar = self.calendar_get(teacher_id);
        let cal_guard = match &calendar {
            Some(cal) => Some(cal.read().await),
            None => None,
        };

        super::validate::check_availability(cal_guard.as_deref(), teacher_id, &block)
            .map_err(|r| self.reject(r))?;
        self.check_teacher_overlap(tracks.get(&key), teacher_id, &block, &HashSet::new())
            .map_err(|r| self.reject(r))?;

        let appointment = Appointment {
            id: Ulid::new(),
            teacher_id,
            student_id,
            block,
        };
        let event = Event::AppointmentCreated {
            appointment: appointment.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_booking_event(&event, &mut tracks);
        self.feed.publish(teacher_id, &event);
        metrics::counter!(crate::observability::APPOINTMENTS_CREATED_TOTAL).increment(1);
        Ok(appointment)
    }

    pub async fn cancel_appointment(&self, appointment_id: Ulid) -> Result<(), EngineError> {
        if !self.appointments.contains_key(&appointment_id) {
            return Err(self.reject(Rejection::NotFound {
                kind: "appointment",
                id: appointment_id,
            }));
        }
        let (keys, mut tracks) = self.lock_booking(appointment_id, &[]).await;
        if !self.appointments.contains_key(&appointment_id) {
            return Err(self.reject(Rejection::NotFound {
                kind: "appointment",
                id: appointment_id,
            }));
        }

        let event = Event::AppointmentCancelled { id: appointment_id };
        self.wal_append(&event).await?;
        self.apply_booking_event(&event, &mut tracks);
        for key in &keys {
            if let TrackKey::Teacher(teacher_id) = key {
                self.feed.publish(*teacher_id, &event);
            }
        }
        Ok(())
    }

    /// Move an appointment to another teacher. Single scope only; an
    /// appointment has no class series to range over, and no audit row
    /// (the audit trail is session-scoped).
    pub async fn reassign_appointment(
        &self,
        appointment_id: Ulid,
        new_teacher_id: Ulid,
    ) -> Result<(), EngineError> {
        let appointment = self
            .appointments
            .get(&appointment_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                self.reject(Rejection::NotFound {
                    kind: "appointment",
                    id: appointment_id,
                })
            })?;
        if self.services.directory.teacher(new_teacher_id).is_none() {
            return Err(self.reject(Rejection::NotFound {
                kind: "teacher",
                id: new_teacher_id,
            }));
        }

        let new_key = TrackKey::Teacher(new_teacher_id);
        let (keys, mut tracks) = self.lock_booking(appointment_id, &[new_key]).await;
        let calendar = self.calendar_get(new_teacher_id);
        let cal_guard = match &calendar {
            Some(cal) => Some(cal.read().await),
            None => None,
        };

        let exclude = HashSet::from([appointment_id]);
        super::validate::check_availability(cal_guard.as_deref(), new_teacher_id, &appointment.block)
            .map_err(|r| self.reject(r))?;
        self.check_teacher_overlap(tracks.get(&new_key), new_teacher_id, &appointment.block, &exclude)
            .map_err(|r| self.reject(r))?;

        let event = Event::AppointmentTeacherSet {
            appointment_id,
            teacher_id: new_teacher_id,
        };
        self.wal_append(&event).await?;
        self.apply_booking_event(&event, &mut tracks);
        for key in &keys {
            if let TrackKey::Teacher(teacher_id) = key {
                self.feed.publish(*teacher_id, &event);
            }
        }
        Ok(())
    }

    // ── Availability administration ──────────────────────

    pub async fn add_rule(
        &self,
        teacher_id: Ulid,
        weekday: Weekday,
        span: MinuteSpan,
    ) -> Result<Ulid, EngineError> {
        slot_ok(&span)?;
        if self.services.directory.teacher(teacher_id).is_none() {
            return Err(self.reject(Rejection::NotFound {
                kind: "teacher",
                id: teacher_id,
            }));
        }
        let calendar = self.calendar_handle(teacher_id);
        let mut guard = calendar.write().await;
        if guard.rule_count() >= MAX_RULES_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many rules for teacher"));
        }

        let id = Ulid::new();
        let event = Event::RuleAdded {
            id,
            teacher_id,
            weekday: weekday_num(weekday),
            span,
        };
        self.wal_append(&event).await?;
        self.apply_calendar_event(&event, &mut guard);
        self.feed.publish(teacher_id, &event);
        Ok(id)
    }

    pub async fn remove_rule(&self, rule_id: Ulid) -> Result<(), EngineError> {
        let teacher_id = self
            .rule_index
            .get(&rule_id)
            .map(|e| *e.value())
            .ok_or_else(|| {
                self.reject(Rejection::NotFound {
                    kind: "rule",
                    id: rule_id,
                })
            })?;
        let calendar = self.calendar_handle(teacher_id);
        let mut guard = calendar.write().await;

        let event = Event::RuleRemoved {
            id: rule_id,
            teacher_id,
        };
        self.wal_append(&event).await?;
        self.apply_calendar_event(&event, &mut guard);
        self.feed.publish(teacher_id, &event);
        Ok(())
    }

    /// Install an override day, replacing that date's rules entirely. An
    /// empty slot list is an explicit closed day.
    pub async fn set_override_day(
        &self,
        teacher_id: Ulid,
        date: NaiveDate,
        slots: Vec<MinuteSpan>,
    ) -> Result<(), EngineError> {
        if slots.len() > MAX_OVERRIDE_SLOTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many override slots"));
        }
        for slot in &slots {
            slot_ok(slot)?;
        }
        if self.services.directory.teacher(teacher_id).is_none() {
            return Err(self.reject(Rejection::NotFound {
                kind: "teacher",
                id: teacher_id,
            }));
        }
        let calendar = self.calendar_handle(teacher_id);
        let mut guard = calendar.write().await;

        let event = Event::OverrideDaySet {
            teacher_id,
            date,
            slots,
        };
        self.wal_append(&event).await?;
        self.apply_calendar_event(&event, &mut guard);
        self.feed.publish(teacher_id, &event);
        Ok(())
    }

    /// Remove an override day, falling back to weekly rules. No-op when
    /// the date has no override day.
    pub async fn clear_override_day(
        &self,
        teacher_id: Ulid,
        date: NaiveDate,
    ) -> Result<(), EngineError> {
        let Some(calendar) = self.calendar_get(teacher_id) else {
            return Ok(());
        };
        let mut guard = calendar.write().await;
        if guard.override_slots(date).is_none() {
            return Ok(());
        }

        let event = Event::OverrideDayCleared { teacher_id, date };
        self.wal_append(&event).await?;
        self.apply_calendar_event(&event, &mut guard);
        self.feed.publish(teacher_id, &event);
        Ok(())
    }
}
