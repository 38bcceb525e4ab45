//! External collaborators. The engine never owns reference-data CRUD,
//! enrollment, billing, or slot curation; it reaches them through these
//! traits. In-memory implementations ship for embedding and tests.

use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use ulid::Ulid;

use crate::model::{Campus, Class, OneOnOneKey, Room, Teacher, TimeBlock};

/// Read-only reference data lookups.
pub trait Directory: Send + Sync {
    fn teacher(&self, id: Ulid) -> Option<Teacher>;
    fn class(&self, id: Ulid) -> Option<Class>;
    fn room(&self, id: Ulid) -> Option<Room>;
    fn campus(&self, id: Ulid) -> Option<Campus>;
    /// Resolve a one-on-one bucket key to its shared class, if provisioned.
    fn one_on_one_class(&self, key: &OneOnOneKey) -> Option<Ulid>;
}

pub trait EnrollmentStore: Send + Sync {
    fn is_enrolled(&self, student_id: Ulid, class_id: Ulid) -> bool;
}

/// Package-ledger service. Billing itself is out of scope; the engine
/// consumes only the yes/no predicate and the cancellation reversal hook.
pub trait PackageLedger: Send + Sync {
    fn has_active_package(&self, student_id: Ulid, course_id: Ulid, at: NaiveDate) -> bool;
    fn reverse_deduction(&self, session_id: Ulid);
}

/// Admin-curated visibility for public booking slots. Display-only; the
/// validator never consults it.
pub trait CurationStore: Send + Sync {
    fn is_visible(&self, teacher_id: Ulid, block: &TimeBlock) -> bool;
}

// ── In-memory implementations ────────────────────────────────────

#[derive(Default)]
pub struct InMemoryDirectory {
    teachers: DashMap<Ulid, Teacher>,
    classes: DashMap<Ulid, Class>,
    rooms: DashMap<Ulid, Room>,
    campuses: DashMap<Ulid, Campus>,
    buckets: DashMap<OneOnOneKey, Ulid>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_teacher(&self, teacher: Teacher) {
        self.teachers.insert(teacher.id, teacher);
    }

    /// One-on-one classes register their bucket key automatically.
    pub fn upsert_class(&self, class: Class) {
        if class.is_one_on_one() {
            self.buckets.insert(OneOnOneKey::of_class(&class), class.id);
        }
        self.classes.insert(class.id, class);
    }

    pub fn upsert_room(&self, room: Room) {
        self.rooms.insert(room.id, room);
    }

    pub fn upsert_campus(&self, campus: Campus) {
        self.campuses.insert(campus.id, campus);
    }

    pub fn remove_class(&self, id: Ulid) {
        if let Some((_, class)) = self.classes.remove(&id)
            && class.is_one_on_one()
        {
            self.buckets.remove(&OneOnOneKey::of_class(&class));
        }
    }
}

impl Directory for InMemoryDirectory {
    fn teacher(&self, id: Ulid) -> Option<Teacher> {
        self.teachers.get(&id).map(|e| e.value().clone())
    }

    fn class(&self, id: Ulid) -> Option<Class> {
        self.classes.get(&id).map(|e| e.value().clone())
    }

    fn room(&self, id: Ulid) -> Option<Room> {
        self.rooms.get(&id).map(|e| e.value().clone())
    }

    fn campus(&self, id: Ulid) -> Option<Campus> {
        self.campuses.get(&id).map(|e| e.value().clone())
    }

    fn one_on_one_class(&self, key: &OneOnOneKey) -> Option<Ulid> {
        self.buckets.get(key).map(|e| *e.value())
    }
}

#[derive(Default)]
pub struct InMemoryEnrollments {
    enrolled: DashSet<(Ulid, Ulid)>,
}

impl InMemoryEnrollments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, student_id: Ulid, class_id: Ulid) {
        self.enrolled.insert((student_id, class_id));
    }

    pub fn withdraw(&self, student_id: Ulid, class_id: Ulid) {
        self.enrolled.remove(&(student_id, class_id));
    }
}

impl EnrollmentStore for InMemoryEnrollments {
    fn is_enrolled(&self, student_id: Ulid, class_id: Ulid) -> bool {
        self.enrolled.contains(&(student_id, class_id))
    }
}

/// Grants don't expire here; date-sensitive behavior belongs to the real
/// ledger service.
#[derive(Default)]
pub struct InMemoryLedger {
    active: DashSet<(Ulid, Ulid)>,
    reversed: DashSet<Ulid>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, student_id: Ulid, course_id: Ulid) {
        self.active.insert((student_id, course_id));
    }

    pub fn was_reversed(&self, session_id: Ulid) -> bool {
        self.reversed.contains(&session_id)
    }
}

impl PackageLedger for InMemoryLedger {
    fn has_active_package(&self, student_id: Ulid, course_id: Ulid, _at: NaiveDate) -> bool {
        self.active.contains(&(student_id, course_id))
    }

    fn reverse_deduction(&self, session_id: Ulid) {
        self.reversed.insert(session_id);
    }
}

#[derive(Default)]
pub struct InMemoryCuration {
    visible: DashSet<(Ulid, TimeBlock)>,
}

impl InMemoryCuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_visible(&self, teacher_id: Ulid, block: TimeBlock) {
        self.visible.insert((teacher_id, block));
    }

    pub fn hide(&self, teacher_id: Ulid, block: TimeBlock) {
        self.visible.remove(&(teacher_id, block));
    }
}

impl CurationStore for InMemoryCuration {
    fn is_visible(&self, teacher_id: Ulid, block: &TimeBlock) -> bool {
        self.visible.contains(&(teacher_id, *block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(capacity: u32) -> Class {
        Class {
            id: Ulid::new(),
            course_id: Ulid::new(),
            subject_id: None,
            level_id: None,
            teacher_id: Ulid::new(),
            campus_id: Ulid::new(),
            room_id: None,
            capacity,
            label: None,
        }
    }

    #[test]
    fn one_on_one_class_registers_bucket() {
        let dir = InMemoryDirectory::new();
        let c = class(1);
        let key = OneOnOneKey::of_class(&c);
        dir.upsert_class(c.clone());
        assert_eq!(dir.one_on_one_class(&key), Some(c.id));

        dir.remove_class(c.id);
        assert_eq!(dir.one_on_one_class(&key), None);
    }

    #[test]
    fn group_class_registers_no_bucket() {
        let dir = InMemoryDirectory::new();
        let c = class(8);
        let key = OneOnOneKey::of_class(&c);
        dir.upsert_class(c);
        assert_eq!(dir.one_on_one_class(&key), None);
    }

    #[test]
    fn ledger_tracks_reversals() {
        let ledger = InMemoryLedger::new();
        let (student, course, session) = (Ulid::new(), Ulid::new(), Ulid::new());
        let today = chrono::NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert!(!ledger.has_active_package(student, course, today));
        ledger.grant(student, course);
        assert!(ledger.has_active_package(student, course, today));

        assert!(!ledger.was_reversed(session));
        ledger.reverse_deduction(session);
        assert!(ledger.was_reversed(session));
    }
}
