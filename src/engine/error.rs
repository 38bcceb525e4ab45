use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::{weekday_name, MinuteSpan, TimeBlock};

use super::availability::format_slots;

/// The booking that got in the way, with enough structure to render a
/// precise operator-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub booking_id: Ulid,
    pub description: String,
    pub block: TimeBlock,
}

/// Expected, recoverable validation outcomes. These are values, never
/// panics; the UI layer maps `code()` to user-facing messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InvalidInterval {
        start_at: NaiveDateTime,
        end_at: NaiveDateTime,
    },
    MultiDaySpan {
        start_at: NaiveDateTime,
        end_at: NaiveDateTime,
    },
    StudentRequired {
        class_id: Ulid,
    },
    NotEnrolled {
        student_id: Ulid,
        class_id: Ulid,
    },
    PackageRequired {
        student_id: Ulid,
        course_id: Ulid,
    },
    TeacherUnqualified {
        teacher_id: Ulid,
        subject_id: Ulid,
    },
    OutsideAvailability {
        teacher_id: Ulid,
        /// 0 = Monday.
        weekday: u8,
        slots: Vec<MinuteSpan>,
    },
    Duplicate {
        session_id: Ulid,
    },
    TeacherConflict {
        teacher_id: Ulid,
        with: ConflictInfo,
    },
    RoomConflict {
        room_id: Ulid,
        with: ConflictInfo,
    },
    CapacityExceeded {
        room_id: Ulid,
        room_capacity: u32,
        class_capacity: u32,
    },
    RoomRequired {
        campus_id: Ulid,
    },
    NotFound {
        kind: &'static str,
        id: Ulid,
    },
}

impl Rejection {
    /// Stable wire code for handlers and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidInterval { .. } => "INVALID_INTERVAL",
            Rejection::MultiDaySpan { .. } => "MULTI_DAY_SPAN",
            Rejection::StudentRequired { .. } => "STUDENT_REQUIRED",
            Rejection::NotEnrolled { .. } => "NOT_ENROLLED",
            Rejection::PackageRequired { .. } => "PACKAGE_REQUIRED",
            Rejection::TeacherUnqualified { .. } => "TEACHER_UNQUALIFIED",
            Rejection::OutsideAvailability { .. } => "OUTSIDE_AVAILABILITY",
            Rejection::Duplicate { .. } => "DUPLICATE",
            Rejection::TeacherConflict { .. } => "TEACHER_CONFLICT",
            Rejection::RoomConflict { .. } => "ROOM_CONFLICT",
            Rejection::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Rejection::RoomRequired { .. } => "ROOM_REQUIRED",
            Rejection::NotFound { .. } => "NOT_FOUND",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::InvalidInterval { start_at, end_at } => {
                write!(f, "interval [{start_at}, {end_at}) has no positive duration")
            }
            Rejection::MultiDaySpan { start_at, end_at } => {
                write!(f, "interval [{start_at}, {end_at}) spans more than one calendar day")
            }
            Rejection::StudentRequired { class_id } => {
                write!(f, "one-on-one class {class_id} requires a student")
            }
            Rejection::NotEnrolled { student_id, class_id } => {
                write!(f, "student {student_id} is not enrolled in class {class_id}")
            }
            Rejection::PackageRequired { student_id, course_id } => {
                write!(f, "student {student_id} has no active package for course {course_id}")
            }
            Rejection::TeacherUnqualified { teacher_id, subject_id } => {
                write!(f, "teacher {teacher_id} is not qualified for subject {subject_id}")
            }
            Rejection::OutsideAvailability { teacher_id, weekday, slots } => {
                write!(
                    f,
                    "teacher {teacher_id} is not available at the requested time on {}; available: {}",
                    weekday_name(*weekday),
                    format_slots(slots)
                )
            }
            Rejection::Duplicate { session_id } => {
                write!(f, "an identical session already exists: {session_id}")
            }
            Rejection::TeacherConflict { teacher_id, with } => {
                write!(
                    f,
                    "teacher {teacher_id} already has {} at {}",
                    with.description, with.block
                )
            }
            Rejection::RoomConflict { room_id, with } => {
                write!(
                    f,
                    "room {room_id} is already occupied by {} at {}",
                    with.description, with.block
                )
            }
            Rejection::CapacityExceeded { room_id, room_capacity, class_capacity } => {
                write!(
                    f,
                    "class capacity {class_capacity} exceeds room {room_id} capacity {room_capacity}"
                )
            }
            Rejection::RoomRequired { campus_id } => {
                write!(f, "campus {campus_id} is not online; a room is required")
            }
            Rejection::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// A single booking was rejected.
    Rejected(Rejection),
    /// A batch or scoped operation was rejected because of one specific
    /// occurrence; the whole operation performed no writes.
    OccurrenceRejected {
        occurrence: TimeBlock,
        rejection: Rejection,
    },
    LimitExceeded(&'static str),
    Wal(String),
}

impl EngineError {
    /// The underlying rejection, if this is a validation outcome rather
    /// than an infrastructure failure.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            EngineError::Rejected(r) => Some(r),
            EngineError::OccurrenceRejected { rejection, .. } => Some(rejection),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Rejected(r) => write!(f, "{r}"),
            EngineError::OccurrenceRejected { occurrence, rejection } => {
                write!(f, "occurrence {occurrence} rejected: {rejection}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Rejection> for EngineError {
    fn from(rejection: Rejection) -> Self {
        EngineError::Rejected(rejection)
    }
}
