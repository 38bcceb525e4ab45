use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::{TimeBlock, Track, TrackEntry};

// ── Point check ──────────────────────────────────────────────────

/// First booking on the track overlapping `block`, skipping `exclude`.
/// Strict half-open overlap: touching endpoints are not conflicts.
pub(crate) fn find_overlap<'a>(
    track: &'a Track,
    block: &TimeBlock,
    exclude: &HashSet<Ulid>,
) -> Option<&'a TrackEntry> {
    track
        .overlapping(block)
        .find(|e| !exclude.contains(&e.booking_id))
}

// ── Batch sweep ──────────────────────────────────────────────────

/// One booking in a dashboard sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepEvent {
    pub id: Ulid,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
}

/// All pairwise overlaps in a collection of bookings, as a bidirectional
/// conflict map. Sort by start, then for each event scan forward while
/// successors start before it ends; sorted order guarantees nothing past
/// the first non-overlapping successor can overlap. O(n log n + k).
///
/// Advisory only (dashboard conflict listings) — never authorizes a write.
pub fn find_all_overlaps(events: &[SweepEvent]) -> HashMap<Ulid, HashSet<Ulid>> {
    let mut sorted: Vec<&SweepEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.start_at);

    let mut conflicts: HashMap<Ulid, HashSet<Ulid>> = HashMap::new();
    for i in 0..sorted.len() {
        for j in (i + 1)..sorted.len() {
            if sorted[j].start_at >= sorted[i].end_at {
                break;
            }
            conflicts.entry(sorted[i].id).or_default().insert(sorted[j].id);
            conflicts.entry(sorted[j].id).or_default().insert(sorted[i].id);
        }
    }
    conflicts
}

/// Campus-wide variant: group by room, then run the single-track sweep
/// independently per room. Bookings without a room never conflict here.
pub fn find_room_overlaps(events: &[(Option<Ulid>, SweepEvent)]) -> HashMap<Ulid, HashSet<Ulid>> {
    let mut by_room: HashMap<Ulid, Vec<SweepEvent>> = HashMap::new();
    for (room_id, event) in events {
        if let Some(room_id) = room_id {
            by_room.entry(*room_id).or_default().push(*event);
        }
    }

    let mut all: HashMap<Ulid, HashSet<Ulid>> = HashMap::new();
    for room_events in by_room.values() {
        for (id, set) in find_all_overlaps(room_events) {
            all.entry(id).or_default().extend(set);
        }
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 10)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn ev(id: Ulid, start: NaiveDateTime, end: NaiveDateTime) -> SweepEvent {
        SweepEvent { id, start_at: start, end_at: end }
    }

    #[test]
    fn sweep_finds_bidirectional_pairs() {
        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        let events = vec![
            ev(a, at(10, 0), at(11, 0)),
            ev(b, at(10, 30), at(11, 30)),
            ev(c, at(12, 0), at(13, 0)),
        ];
        let conflicts = find_all_overlaps(&events);
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts[&a].contains(&b));
        assert!(conflicts[&b].contains(&a));
        assert!(!conflicts.contains_key(&c));
    }

    #[test]
    fn sweep_touching_endpoints_not_conflicts() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let events = vec![ev(a, at(10, 0), at(11, 0)), ev(b, at(11, 0), at(12, 0))];
        assert!(find_all_overlaps(&events).is_empty());
    }

    #[test]
    fn sweep_long_event_overlaps_many() {
        let ids: Vec<Ulid> = (0..4).map(|_| Ulid::new()).collect();
        let mut events = vec![ev(ids[0], at(9, 0), at(17, 0))];
        for (i, &id) in ids.iter().enumerate().skip(1) {
            let h = 9 + 2 * i as u32;
            events.push(ev(id, at(h, 0), at(h + 1, 0)));
        }
        let conflicts = find_all_overlaps(&events);
        assert_eq!(conflicts[&ids[0]].len(), 3);
        for &id in &ids[1..] {
            assert_eq!(conflicts[&id], HashSet::from([ids[0]]));
        }
    }

    #[test]
    fn sweep_unsorted_input() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let events = vec![ev(b, at(10, 30), at(11, 30)), ev(a, at(10, 0), at(11, 0))];
        let conflicts = find_all_overlaps(&events);
        assert!(conflicts[&a].contains(&b));
    }

    #[test]
    fn sweep_empty() {
        assert!(find_all_overlaps(&[]).is_empty());
    }

    #[test]
    fn room_sweep_groups_per_room() {
        let (r1, r2) = (Ulid::new(), Ulid::new());
        let (a, b, c, d) = (Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new());
        let events = vec![
            (Some(r1), ev(a, at(10, 0), at(11, 0))),
            (Some(r1), ev(b, at(10, 30), at(11, 30))),
            // Same times, different room: no conflict.
            (Some(r2), ev(c, at(10, 0), at(11, 0))),
            // No room: never conflicts.
            (None, ev(d, at(10, 0), at(11, 0))),
        ];
        let conflicts = find_room_overlaps(&events);
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts[&a].contains(&b));
        assert!(conflicts[&b].contains(&a));
        assert!(!conflicts.contains_key(&c));
        assert!(!conflicts.contains_key(&d));
    }
}
