use chrono::{Datelike, NaiveDate};

use crate::model::{weekday_num, MinuteSpan, TeacherCalendar, TimeBlock};

// ── Availability Algorithm ────────────────────────────────────────

/// Authoritative free slots for a teacher on one date, sorted by start.
///
/// Override day: REPLACE — if the date has an override day (even an empty
/// one), its slots are the whole answer. Otherwise the weekday's
/// recurring rules apply. No calendar at all means no availability; the
/// caller treats the empty list as a hard rejection, not an error.
pub fn resolve_availability(calendar: Option<&TeacherCalendar>, date: NaiveDate) -> Vec<MinuteSpan> {
    let Some(cal) = calendar else {
        return Vec::new();
    };
    if let Some(slots) = cal.override_slots(date) {
        return slots;
    }
    cal.rules_for(weekday_num(date.weekday()))
}

/// An interval is within availability only when a *single* slot fully
/// contains it — no stitching across adjacent slots. Returns the day's
/// slots alongside the verdict for operator diagnostics.
pub fn within_availability(
    calendar: Option<&TeacherCalendar>,
    block: &TimeBlock,
) -> (bool, Vec<MinuteSpan>) {
    let slots = resolve_availability(calendar, block.date);
    let ok = slots.iter().any(|slot| slot.contains(&block.span));
    (ok, slots)
}

/// Render a slot list for failure messages.
pub fn format_slots(slots: &[MinuteSpan]) -> String {
    if slots.is_empty() {
        return "none".into();
    }
    slots
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
