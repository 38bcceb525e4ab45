use std::collections::HashMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minute of day, `0..=1440`.
pub type Minutes = u16;

pub const MINUTES_PER_DAY: Minutes = 1440;

pub const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// Weekday index, 0 = Monday.
pub fn weekday_num(weekday: Weekday) -> u8 {
    weekday.num_days_from_monday() as u8
}

pub fn weekday_from_num(num: u8) -> Weekday {
    match num % 7 {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

pub fn weekday_name(num: u8) -> &'static str {
    WEEKDAY_NAMES[(num % 7) as usize]
}

/// Half-open minute window `[start_min, end_min)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MinuteSpan {
    pub start_min: Minutes,
    pub end_min: Minutes,
}

impl MinuteSpan {
    pub fn new(start_min: Minutes, end_min: Minutes) -> Self {
        debug_assert!(start_min < end_min, "MinuteSpan start must be before end");
        debug_assert!(end_min <= MINUTES_PER_DAY, "MinuteSpan must stay within a day");
        Self { start_min, end_min }
    }

    pub fn duration_min(&self) -> Minutes {
        self.end_min - self.start_min
    }

    pub fn overlaps(&self, other: &MinuteSpan) -> bool {
        self.start_min < other.end_min && other.start_min < self.end_min
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &MinuteSpan) -> bool {
        self.start_min <= other.start_min && other.end_min <= self.end_min
    }
}

fn fmt_minute(f: &mut fmt::Formatter<'_>, min: Minutes) -> fmt::Result {
    write!(f, "{:02}:{:02}", min / 60, min % 60)
}

impl fmt::Display for MinuteSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_minute(f, self.start_min)?;
        write!(f, "-")?;
        fmt_minute(f, self.end_min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBlockError {
    /// Zero or negative duration (or sub-minute).
    Empty,
    /// Interval crosses a calendar-day boundary.
    MultiDay,
}

/// A concrete half-open block on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeBlock {
    pub date: NaiveDate,
    pub span: MinuteSpan,
}

impl TimeBlock {
    pub fn new(date: NaiveDate, span: MinuteSpan) -> Self {
        Self { date, span }
    }

    /// Build from a datetime pair at minute granularity. An end at exactly
    /// midnight of the following day is legal and maps to `end_min == 1440`;
    /// anything else crossing the day boundary is `MultiDay`.
    pub fn from_datetimes(
        start_at: NaiveDateTime,
        end_at: NaiveDateTime,
    ) -> Result<Self, TimeBlockError> {
        if end_at <= start_at {
            return Err(TimeBlockError::Empty);
        }
        let start_min = minute_of(start_at);
        if end_at.date() == start_at.date() {
            let end_min = minute_of(end_at);
            if end_min <= start_min {
                return Err(TimeBlockError::Empty);
            }
            return Ok(Self::new(start_at.date(), MinuteSpan::new(start_min, end_min)));
        }
        let next_midnight = start_at.date().succ_opt().map(|d| d.and_time(NaiveTime::MIN));
        if next_midnight == Some(end_at) {
            return Ok(Self::new(
                start_at.date(),
                MinuteSpan::new(start_min, MINUTES_PER_DAY),
            ));
        }
        Err(TimeBlockError::MultiDay)
    }

    pub fn start_at(&self) -> NaiveDateTime {
        self.date.and_time(NaiveTime::MIN)
            + chrono::Duration::minutes(i64::from(self.span.start_min))
    }

    pub fn end_at(&self) -> NaiveDateTime {
        self.date.and_time(NaiveTime::MIN) + chrono::Duration::minutes(i64::from(self.span.end_min))
    }

    pub fn weekday(&self) -> Weekday {
        self.date.weekday()
    }

    pub fn overlaps(&self, other: &TimeBlock) -> bool {
        self.date == other.date && self.span.overlaps(&other.span)
    }
}

impl fmt::Display for TimeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, self.span)
    }
}

fn minute_of(at: NaiveDateTime) -> Minutes {
    use chrono::Timelike;
    (at.time().hour() * 60 + at.time().minute()) as Minutes
}

// ── Reference data (owned by the external record store) ──────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: Ulid,
    pub name: Option<String>,
    /// Single primary subject, the older representation.
    pub primary_subject: Option<Ulid>,
    /// Many-subject qualification list.
    pub subjects: Vec<Ulid>,
}

/// The one qualification predicate, covering both representations.
pub fn teacher_qualified_for(teacher: &Teacher, subject_id: Ulid) -> bool {
    teacher.primary_subject == Some(subject_id) || teacher.subjects.contains(&subject_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campus {
    pub id: Ulid,
    pub name: Option<String>,
    /// Online campuses need no room assignment.
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub campus_id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub id: Ulid,
    pub course_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub level_id: Option<Ulid>,
    pub teacher_id: Ulid,
    pub campus_id: Ulid,
    pub room_id: Option<Ulid>,
    pub capacity: u32,
    pub label: Option<String>,
}

impl Class {
    pub fn is_one_on_one(&self) -> bool {
        self.capacity == 1
    }

    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("class {}", self.id))
    }
}

/// Explicit grouping key for one-on-one class templates shared across
/// students. First-class, never a concatenated id string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OneOnOneKey {
    pub teacher_id: Ulid,
    pub course_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub level_id: Option<Ulid>,
    pub campus_id: Ulid,
    pub room_id: Option<Ulid>,
}

impl OneOnOneKey {
    pub fn of_class(class: &Class) -> Self {
        Self {
            teacher_id: class.teacher_id,
            course_id: class.course_id,
            subject_id: class.subject_id,
            level_id: class.level_id,
            campus_id: class.campus_id,
            room_id: class.room_id,
        }
    }
}

// ── Engine-owned entities ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub teacher_id: Ulid,
    /// 0 = Monday.
    pub weekday: u8,
    pub span: MinuteSpan,
}

/// A teacher's recurring weekly rules plus date-specific override days.
/// A date present in `overrides` replaces that date's rules entirely —
/// an empty slot list is an explicit closed day, distinct from absence.
#[derive(Debug, Clone)]
pub struct TeacherCalendar {
    pub teacher_id: Ulid,
    rules: Vec<AvailabilityRule>,
    overrides: HashMap<NaiveDate, Vec<MinuteSpan>>,
}

impl TeacherCalendar {
    pub fn new(teacher_id: Ulid) -> Self {
        Self {
            teacher_id,
            rules: Vec::new(),
            overrides: HashMap::new(),
        }
    }

    /// Insert maintaining (weekday, start) order.
    pub fn insert_rule(&mut self, rule: AvailabilityRule) {
        let pos = self
            .rules
            .binary_search_by_key(&(rule.weekday, rule.span.start_min), |r| {
                (r.weekday, r.span.start_min)
            })
            .unwrap_or_else(|e| e);
        self.rules.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<AvailabilityRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    pub fn rules(&self) -> &[AvailabilityRule] {
        &self.rules
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Sorted rule spans for a weekday (0 = Monday).
    pub fn rules_for(&self, weekday: u8) -> Vec<MinuteSpan> {
        self.rules
            .iter()
            .filter(|r| r.weekday == weekday)
            .map(|r| r.span)
            .collect()
    }

    /// Sorted override slots for a date, or None when the date has no
    /// override day at all.
    pub fn override_slots(&self, date: NaiveDate) -> Option<Vec<MinuteSpan>> {
        self.overrides.get(&date).cloned()
    }

    pub fn set_override_day(&mut self, date: NaiveDate, mut slots: Vec<MinuteSpan>) {
        slots.sort();
        self.overrides.insert(date, slots);
    }

    pub fn clear_override_day(&mut self, date: NaiveDate) -> bool {
        self.overrides.remove(&date).is_some()
    }

    pub fn override_days(&self) -> impl Iterator<Item = (NaiveDate, &[MinuteSpan])> {
        self.overrides.iter().map(|(d, s)| (*d, s.as_slice()))
    }
}

/// A concrete scheduled occurrence of a class. `teacher_id` is an
/// override; the effective teacher is `teacher_id ?? class.teacher_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub class_id: Ulid,
    pub block: TimeBlock,
    pub teacher_id: Option<Ulid>,
    pub student_id: Option<Ulid>,
}

/// Ad-hoc teacher/student time block not tied to a class. Conflicts on
/// the teacher dimension exactly like a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub student_id: Ulid,
    pub block: TimeBlock,
}

/// Append-only audit row, written whenever a session's effective teacher
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherChange {
    pub id: Ulid,
    pub session_id: Ulid,
    pub from_teacher_id: Ulid,
    pub to_teacher_id: Ulid,
    pub reason: Option<String>,
    pub changed_at: NaiveDateTime,
}

/// Weekly one-on-one recurrence, expanded by the batch generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceTemplate {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub student_id: Ulid,
    pub class_id: Ulid,
    /// 0 = Monday.
    pub weekday: u8,
    pub start_min: Minutes,
    pub duration_min: Minutes,
}

// ── Booking tracks ───────────────────────────────────────────────

/// The lockable booking dimensions. The derived ordering is the global
/// lock-acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackKey {
    Teacher(Ulid),
    Room(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingKind {
    Session { class_id: Ulid },
    Appointment { student_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEntry {
    pub booking_id: Ulid,
    pub block: TimeBlock,
    pub kind: BookingKind,
}

/// One dimension's committed bookings, sorted by (date, start).
#[derive(Debug, Clone)]
pub struct Track {
    pub key: TrackKey,
    pub entries: Vec<TrackEntry>,
}

impl Track {
    pub fn new(key: TrackKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
        }
    }

    /// Insert maintaining sort order by (date, start).
    pub fn insert_entry(&mut self, entry: TrackEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&(entry.block.date, entry.block.span.start_min), |e| {
                (e.block.date, e.block.span.start_min)
            })
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, booking_id: Ulid) -> Option<TrackEntry> {
        let pos = self.entries.iter().position(|e| e.booking_id == booking_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose block overlaps the query block. Binary search skips
    /// everything starting at or after the query end.
    pub fn overlapping(&self, block: &TimeBlock) -> impl Iterator<Item = &TrackEntry> {
        let bound = self.entries.partition_point(|e| {
            (e.block.date, e.block.span.start_min) < (block.date, block.span.end_min)
        });
        let query = *block;
        self.entries[..bound].iter().filter(move |e| {
            e.block.date == query.date && e.block.span.end_min > query.span.start_min
        })
    }
}

// ── WAL record format ────────────────────────────────────────────

/// The event types — flat, no nesting. Booking events carry resolved
/// placement (effective teacher, room) so replay never consults the
/// external directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RuleAdded {
        id: Ulid,
        teacher_id: Ulid,
        weekday: u8,
        span: MinuteSpan,
    },
    RuleRemoved {
        id: Ulid,
        teacher_id: Ulid,
    },
    OverrideDaySet {
        teacher_id: Ulid,
        date: NaiveDate,
        slots: Vec<MinuteSpan>,
    },
    OverrideDayCleared {
        teacher_id: Ulid,
        date: NaiveDate,
    },
    SessionCreated {
        session: Session,
        effective_teacher_id: Ulid,
        room_id: Option<Ulid>,
    },
    SessionCancelled {
        id: Ulid,
    },
    SessionTeacherSet {
        session_id: Ulid,
        stored_override: Option<Ulid>,
        effective_teacher_id: Ulid,
    },
    TeacherChangeRecorded {
        change: TeacherChange,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentCancelled {
        id: Ulid,
    },
    AppointmentTeacherSet {
        appointment_id: Ulid,
        teacher_id: Ulid,
    },
}
