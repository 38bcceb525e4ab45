use std::collections::HashSet;

use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::directory::Directory;
use crate::model::*;

use super::availability::within_availability;
use super::conflict::find_overlap;
use super::error::{ConflictInfo, EngineError, Rejection};
use super::Engine;

/// A booking proposal as request handlers submit it.
#[derive(Debug, Clone)]
pub struct BookingCandidate {
    pub class_id: Ulid,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
    pub student_id: Option<Ulid>,
}

/// Reference data resolved once per validation.
pub(super) struct ResolvedRefs {
    pub class: Class,
    /// Effective teacher record.
    pub teacher: Teacher,
    pub room: Option<Room>,
    pub campus: Campus,
}

impl ResolvedRefs {
    pub(super) fn track_keys(&self) -> Vec<TrackKey> {
        let mut keys = vec![TrackKey::Teacher(self.teacher.id)];
        if let Some(room) = &self.room {
            keys.push(TrackKey::Room(room.id));
        }
        keys
    }
}

// ── Ordered checks. First failure wins. ──────────────────────────

/// Check 1: single calendar day, positive duration.
pub(super) fn check_interval(
    start_at: NaiveDateTime,
    end_at: NaiveDateTime,
) -> Result<TimeBlock, Rejection> {
    TimeBlock::from_datetimes(start_at, end_at).map_err(|e| match e {
        TimeBlockError::Empty => Rejection::InvalidInterval { start_at, end_at },
        TimeBlockError::MultiDay => Rejection::MultiDaySpan { start_at, end_at },
    })
}

/// Check 3: effective teacher must be qualified for the class subject.
pub(super) fn check_qualification(teacher: &Teacher, class: &Class) -> Result<(), Rejection> {
    if let Some(subject_id) = class.subject_id
        && !teacher_qualified_for(teacher, subject_id)
    {
        return Err(Rejection::TeacherUnqualified {
            teacher_id: teacher.id,
            subject_id,
        });
    }
    Ok(())
}

/// Check 4: interval fully inside a single availability slot.
pub(super) fn check_availability(
    calendar: Option<&TeacherCalendar>,
    teacher_id: Ulid,
    block: &TimeBlock,
) -> Result<(), Rejection> {
    let (ok, slots) = within_availability(calendar, block);
    if ok {
        Ok(())
    } else {
        Err(Rejection::OutsideAvailability {
            teacher_id,
            weekday: weekday_num(block.weekday()),
            slots,
        })
    }
}

/// Check 5: no session of this class at the exact same block.
pub(super) fn check_duplicate(
    existing: &[(Ulid, TimeBlock)],
    block: &TimeBlock,
    exclude: &HashSet<Ulid>,
) -> Result<(), Rejection> {
    for (session_id, existing_block) in existing {
        if existing_block == block && !exclude.contains(session_id) {
            return Err(Rejection::Duplicate {
                session_id: *session_id,
            });
        }
    }
    Ok(())
}

/// Checks 8 + 9: room capacity fit, or online campus when roomless.
pub(super) fn check_room_fit(
    class: &Class,
    room: Option<&Room>,
    campus: &Campus,
) -> Result<(), Rejection> {
    match room {
        Some(room) if class.capacity > room.capacity => Err(Rejection::CapacityExceeded {
            room_id: room.id,
            room_capacity: room.capacity,
            class_capacity: class.capacity,
        }),
        Some(_) => Ok(()),
        None if campus.online => Ok(()),
        None => Err(Rejection::RoomRequired {
            campus_id: campus.id,
        }),
    }
}

/// Operator-facing description of an occupying booking.
pub(super) fn describe_entry(directory: &dyn Directory, entry: &TrackEntry) -> String {
    match &entry.kind {
        BookingKind::Session { class_id } => match directory.class(*class_id) {
            Some(class) => {
                let teacher = directory
                    .teacher(class.teacher_id)
                    .and_then(|t| t.name)
                    .unwrap_or_else(|| class.teacher_id.to_string());
                let place = match class.room_id.and_then(|r| directory.room(r)) {
                    Some(room) => {
                        let campus = directory
                            .campus(room.campus_id)
                            .and_then(|c| c.name)
                            .unwrap_or_else(|| room.campus_id.to_string());
                        format!(
                            "{campus}/{}",
                            room.name.unwrap_or_else(|| room.id.to_string())
                        )
                    }
                    None => directory
                        .campus(class.campus_id)
                        .and_then(|c| c.name)
                        .unwrap_or_else(|| class.campus_id.to_string()),
                };
                format!("{} ({teacher}, {place})", class.display_label())
            }
            None => format!("session {}", entry.booking_id),
        },
        BookingKind::Appointment { student_id } => {
            format!("appointment with student {student_id}")
        }
    }
}

impl Engine {
    pub(super) fn resolve_refs(
        &self,
        class_id: Ulid,
        teacher_override: Option<Ulid>,
    ) -> Result<ResolvedRefs, Rejection> {
        let directory = &self.services.directory;
        let class = directory.class(class_id).ok_or(Rejection::NotFound {
            kind: "class",
            id: class_id,
        })?;
        let teacher_id = teacher_override.unwrap_or(class.teacher_id);
        let teacher = directory.teacher(teacher_id).ok_or(Rejection::NotFound {
            kind: "teacher",
            id: teacher_id,
        })?;
        let campus = directory.campus(class.campus_id).ok_or(Rejection::NotFound {
            kind: "campus",
            id: class.campus_id,
        })?;
        let room = match class.room_id {
            Some(room_id) => Some(directory.room(room_id).ok_or(Rejection::NotFound {
                kind: "room",
                id: room_id,
            })?),
            None => None,
        };
        Ok(ResolvedRefs {
            class,
            teacher,
            room,
            campus,
        })
    }

    pub(super) fn class_session_blocks(&self, class_id: Ulid) -> Vec<(Ulid, TimeBlock)> {
        let Some(ids) = self.class_sessions.get(&class_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|s| (*id, s.block)))
            .collect()
    }

    /// Check 2 (+2b): one-on-one needs an enrolled student with an active
    /// package for the class's course on the occurrence date.
    pub(super) fn check_student(
        &self,
        class: &Class,
        student_id: Option<Ulid>,
        block: &TimeBlock,
    ) -> Result<(), Rejection> {
        if !class.is_one_on_one() {
            return Ok(());
        }
        let student_id = student_id.ok_or(Rejection::StudentRequired { class_id: class.id })?;
        if !self.services.enrollment.is_enrolled(student_id, class.id) {
            return Err(Rejection::NotEnrolled {
                student_id,
                class_id: class.id,
            });
        }
        if !self
            .services
            .ledger
            .has_active_package(student_id, class.course_id, block.date)
        {
            return Err(Rejection::PackageRequired {
                student_id,
                course_id: class.course_id,
            });
        }
        Ok(())
    }

    /// Check 6: no effective-teacher overlap (sessions and appointments).
    pub(super) fn check_teacher_overlap(
        &self,
        track: Option<&Track>,
        teacher_id: Ulid,
        block: &TimeBlock,
        exclude: &HashSet<Ulid>,
    ) -> Result<(), Rejection> {
        if let Some(track) = track
            && let Some(entry) = find_overlap(track, block, exclude)
        {
            return Err(Rejection::TeacherConflict {
                teacher_id,
                with: ConflictInfo {
                    booking_id: entry.booking_id,
                    description: describe_entry(self.services.directory.as_ref(), entry),
                    block: entry.block,
                },
            });
        }
        Ok(())
    }

    /// Check 7: no room overlap. Rooms never conflict with appointments —
    /// appointments carry no room, so none ever land on a room track.
    pub(super) fn check_room_overlap(
        &self,
        track: Option<&Track>,
        room_id: Ulid,
        block: &TimeBlock,
        exclude: &HashSet<Ulid>,
    ) -> Result<(), Rejection> {
        if let Some(track) = track
            && let Some(entry) = find_overlap(track, block, exclude)
        {
            return Err(Rejection::RoomConflict {
                room_id,
                with: ConflictInfo {
                    booking_id: entry.booking_id,
                    description: describe_entry(self.services.directory.as_ref(), entry),
                    block: entry.block,
                },
            });
        }
        Ok(())
    }

    /// Checks 2–9 in order against guarded state. Check 1 already ran
    /// when `block` was built.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn run_booking_checks(
        &self,
        refs: &ResolvedRefs,
        block: &TimeBlock,
        student_id: Option<Ulid>,
        teacher_track: Option<&Track>,
        room_track: Option<&Track>,
        calendar: Option<&TeacherCalendar>,
        exclude: &HashSet<Ulid>,
    ) -> Result<(), Rejection> {
        self.check_student(&refs.class, student_id, block)?;
        check_qualification(&refs.teacher, &refs.class)?;
        check_availability(calendar, refs.teacher.id, block)?;
        check_duplicate(&self.class_session_blocks(refs.class.id), block, exclude)?;
        self.check_teacher_overlap(teacher_track, refs.teacher.id, block, exclude)?;
        if let Some(room) = &refs.room {
            self.check_room_overlap(room_track, room.id, block, exclude)?;
        }
        check_room_fit(&refs.class, refs.room.as_ref(), &refs.campus)
    }

    /// Checks 3–7 only, re-run against a replacement teacher. The target
    /// set's own ids are excluded so a batch doesn't conflict with its own
    /// old assignment.
    pub(super) fn run_reassignment_checks(
        &self,
        refs: &ResolvedRefs,
        block: &TimeBlock,
        teacher_track: Option<&Track>,
        room_track: Option<&Track>,
        calendar: Option<&TeacherCalendar>,
        exclude: &HashSet<Ulid>,
    ) -> Result<(), Rejection> {
        check_qualification(&refs.teacher, &refs.class)?;
        check_availability(calendar, refs.teacher.id, block)?;
        check_duplicate(&self.class_session_blocks(refs.class.id), block, exclude)?;
        self.check_teacher_overlap(teacher_track, refs.teacher.id, block, exclude)?;
        if let Some(room) = &refs.room {
            self.check_room_overlap(room_track, room.id, block, exclude)?;
        }
        Ok(())
    }

    /// Pure accept/reject decision for a proposed booking. No side
    /// effects; mutations re-run the same checks under their own write
    /// locks before committing.
    pub async fn validate_booking(&self, candidate: &BookingCandidate) -> Result<(), EngineError> {
        metrics::counter!(crate::observability::VALIDATIONS_TOTAL).increment(1);
        let block = check_interval(candidate.start_at, candidate.end_at)
            .map_err(|r| self.reject(r))?;
        let refs = self
            .resolve_refs(candidate.class_id, None)
            .map_err(|r| self.reject(r))?;

        let keys = refs.track_keys();
        let tracks = self.read_tracks(&keys).await;
        let calendar = self.calendar_get(refs.teacher.id);
        let cal_guard = match &calendar {
            Some(cal) => Some(cal.read().await),
            None => None,
        };

        let teacher_track = tracks.get(&TrackKey::Teacher(refs.teacher.id));
        let room_track = refs
            .room
            .as_ref()
            .and_then(|room| tracks.get(&TrackKey::Room(room.id)));

        self.run_booking_checks(
            &refs,
            &block,
            candidate.student_id,
            teacher_track,
            room_track,
            cal_guard.as_deref(),
            &HashSet::new(),
        )
        .map_err(|r| self.reject(r))
    }
}
