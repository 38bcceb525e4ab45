mod availability;
mod batch;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod validate;

pub use availability::{format_slots, resolve_availability, within_availability};
pub use batch::{BatchOutcome, ConflictPolicy, DateRange, SkippedOccurrence, WeeklyPattern};
pub use conflict::{find_all_overlaps, find_room_overlaps, SweepEvent};
pub use error::{ConflictInfo, EngineError, Rejection};
pub use mutations::ReassignScope;
pub use slots::SlotCandidate;
pub use validate::BookingCandidate;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::directory::{CurationStore, Directory, EnrollmentStore, PackageLedger};
use crate::model::*;
use crate::notify::ChangeFeed;
use crate::wal::Wal;

pub type SharedTrack = Arc<RwLock<Track>>;
pub type SharedCalendar = Arc<RwLock<TeacherCalendar>>;

/// External collaborators the engine consumes. Reference-data CRUD,
/// enrollment, billing, and slot curation all live behind these handles.
#[derive(Clone)]
pub struct Services {
    pub directory: Arc<dyn Directory>,
    pub enrollment: Arc<dyn EnrollmentStore>,
    pub ledger: Arc<dyn PackageLedger>,
    pub curation: Arc<dyn CurationStore>,
    pub clock: Arc<dyn Clock>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Multi-event commit: all buffered, one flush, one response.
    AppendBatch {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::AppendBatch { events, response } => {
            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                .record(events.len() as f64);
            let flush_start = std::time::Instant::now();
            let mut result = Ok(());
            for event in &events {
                if let Err(e) = wal.append_buffered(event) {
                    result = Err(e);
                    break;
                }
            }
            let flush = wal.flush_sync();
            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                .record(flush_start.elapsed().as_secs_f64());
            let _ = response.send(result.and(flush));
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Track guards ─────────────────────────────────────────

/// Write locks over a sorted, deduped set of tracks. The global
/// acquisition order (TrackKey's Ord) makes multi-track locking
/// deadlock-free.
pub(super) struct TrackWrites {
    guards: HashMap<TrackKey, OwnedRwLockWriteGuard<Track>>,
}

impl TrackWrites {
    pub(super) fn get(&self, key: &TrackKey) -> Option<&Track> {
        self.guards.get(key).map(|g| &**g)
    }

    pub(super) fn get_mut(&mut self, key: &TrackKey) -> &mut Track {
        self.guards
            .get_mut(key)
            .map(|g| &mut **g)
            .expect("track not locked by this operation")
    }
}

/// Read locks, same ordering discipline as writes.
pub(super) struct TrackReads {
    guards: HashMap<TrackKey, OwnedRwLockReadGuard<Track>>,
}

impl TrackReads {
    pub(super) fn get(&self, key: &TrackKey) -> Option<&Track> {
        self.guards.get(key).map(|g| &**g)
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) services: Services,
    pub(super) feed: Arc<ChangeFeed>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Booking tracks, one per teacher and one per room.
    tracks: DashMap<TrackKey, SharedTrack>,
    /// Availability calendars, one per teacher.
    calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) sessions: DashMap<Ulid, Session>,
    pub(super) appointments: DashMap<Ulid, Appointment>,
    /// Reverse lookup: booking id → tracks it is indexed under.
    pub(super) booking_tracks: DashMap<Ulid, Vec<TrackKey>>,
    /// Reverse lookup: rule id → teacher.
    pub(super) rule_index: DashMap<Ulid, Ulid>,
    /// Class → session ids, for duplicate checks and future-scope targets.
    pub(super) class_sessions: DashMap<Ulid, Vec<Ulid>>,
    /// Append-only teacher-change audit trail.
    pub(super) audit: std::sync::RwLock<Vec<TeacherChange>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, services: Services, feed: Arc<ChangeFeed>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            services,
            feed,
            wal_tx,
            tracks: DashMap::new(),
            calendars: DashMap::new(),
            sessions: DashMap::new(),
            appointments: DashMap::new(),
            booking_tracks: DashMap::new(),
            rule_index: DashMap::new(),
            class_sessions: DashMap::new(),
            audit: std::sync::RwLock::new(Vec::new()),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this
        // may run inside an async context.
        for event in &events {
            engine.apply_replayed(event);
        }

        Ok(engine)
    }

    // ── Handles ──────────────────────────────────────────

    pub(super) fn calendar_get(&self, teacher_id: Ulid) -> Option<SharedCalendar> {
        self.calendars.get(&teacher_id).map(|e| e.value().clone())
    }

    pub(super) fn calendar_handle(&self, teacher_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(teacher_id)
            .or_insert_with(|| Arc::new(RwLock::new(TeacherCalendar::new(teacher_id))))
            .clone()
    }

    pub(super) fn track_get(&self, key: &TrackKey) -> Option<SharedTrack> {
        self.tracks.get(key).map(|e| e.value().clone())
    }

    /// Snapshot of all track handles; locks are taken afterwards, never
    /// while iterating the map.
    pub(super) fn track_snapshot(&self) -> Vec<(TrackKey, SharedTrack)> {
        self.tracks
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    fn track_handle(&self, key: TrackKey) -> SharedTrack {
        self.tracks
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(Track::new(key))))
            .clone()
    }

    /// Acquire write locks in global key order. Tracks are created lazily
    /// so a first booking on a fresh teacher/room still locks something.
    pub(super) async fn write_tracks(&self, keys: &[TrackKey]) -> TrackWrites {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = HashMap::new();
        for key in sorted {
            let track = self.track_handle(key);
            guards.insert(key, track.write_owned().await);
        }
        TrackWrites { guards }
    }

    /// Same as `write_tracks` but only for replay, where nothing else can
    /// hold the locks.
    fn write_tracks_uncontended(&self, keys: &[TrackKey]) -> TrackWrites {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = HashMap::new();
        for key in sorted {
            let track = self.track_handle(key);
            guards.insert(
                key,
                track
                    .try_write_owned()
                    .expect("replay: uncontended write"),
            );
        }
        TrackWrites { guards }
    }

    /// Read locks, acquired in the same global order as writes.
    pub(super) async fn read_tracks(&self, keys: &[TrackKey]) -> TrackReads {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = HashMap::new();
        for key in sorted {
            if let Some(track) = self.track_get(&key) {
                guards.insert(key, track.read_owned().await);
            }
        }
        TrackReads { guards }
    }

    // ── WAL plumbing ─────────────────────────────────────

    /// Write one event via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// Write a multi-event commit: everything lands in one flush so a
    /// crash cannot persist an unreported suffix of a batch.
    pub(super) async fn wal_append_batch(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendBatch {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── Event application ────────────────────────────────

    /// Tracks an event touches. Computed *before* applying it, since
    /// cancellation events consult the pre-apply reverse index.
    fn event_track_keys(&self, event: &Event) -> Vec<TrackKey> {
        match event {
            Event::SessionCreated {
                effective_teacher_id,
                room_id,
                ..
            } => {
                let mut keys = vec![TrackKey::Teacher(*effective_teacher_id)];
                if let Some(room_id) = room_id {
                    keys.push(TrackKey::Room(*room_id));
                }
                keys
            }
            Event::SessionCancelled { id }
            | Event::AppointmentCancelled { id } => self
                .booking_tracks
                .get(id)
                .map(|e| e.value().clone())
                .unwrap_or_default(),
            Event::SessionTeacherSet {
                session_id,
                effective_teacher_id,
                ..
            } => {
                let mut keys = self
                    .booking_tracks
                    .get(session_id)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                keys.push(TrackKey::Teacher(*effective_teacher_id));
                keys
            }
            Event::AppointmentTeacherSet {
                appointment_id,
                teacher_id,
            } => {
                let mut keys = self
                    .booking_tracks
                    .get(appointment_id)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                keys.push(TrackKey::Teacher(*teacher_id));
                keys
            }
            Event::AppointmentCreated { appointment } => {
                vec![TrackKey::Teacher(appointment.teacher_id)]
            }
            _ => Vec::new(),
        }
    }

    /// Apply a calendar event. Caller holds the calendar's write lock.
    pub(super) fn apply_calendar_event(&self, event: &Event, cal: &mut TeacherCalendar) {
        match event {
            Event::RuleAdded {
                id,
                teacher_id,
                weekday,
                span,
            } => {
                cal.insert_rule(AvailabilityRule {
                    id: *id,
                    teacher_id: *teacher_id,
                    weekday: *weekday,
                    span: *span,
                });
                self.rule_index.insert(*id, *teacher_id);
            }
            Event::RuleRemoved { id, .. } => {
                cal.remove_rule(*id);
                self.rule_index.remove(id);
            }
            Event::OverrideDaySet { date, slots, .. } => {
                cal.set_override_day(*date, slots.clone());
            }
            Event::OverrideDayCleared { date, .. } => {
                cal.clear_override_day(*date);
            }
            _ => unreachable!("not a calendar event"),
        }
    }

    /// Apply a booking event. Caller holds write locks on every track in
    /// `event_track_keys(event)`.
    pub(super) fn apply_booking_event(&self, event: &Event, tracks: &mut TrackWrites) {
        match event {
            Event::SessionCreated {
                session,
                effective_teacher_id,
                room_id,
            } => {
                let entry = TrackEntry {
                    booking_id: session.id,
                    block: session.block,
                    kind: BookingKind::Session {
                        class_id: session.class_id,
                    },
                };
                let mut keys = vec![TrackKey::Teacher(*effective_teacher_id)];
                tracks.get_mut(&keys[0]).insert_entry(entry.clone());
                if let Some(room_id) = room_id {
                    let key = TrackKey::Room(*room_id);
                    tracks.get_mut(&key).insert_entry(entry);
                    keys.push(key);
                }
                self.class_sessions
                    .entry(session.class_id)
                    .or_default()
                    .push(session.id);
                self.booking_tracks.insert(session.id, keys);
                self.sessions.insert(session.id, session.clone());
            }
            Event::SessionCancelled { id } => {
                if let Some((_, keys)) = self.booking_tracks.remove(id) {
                    for key in keys {
                        tracks.get_mut(&key).remove_entry(*id);
                    }
                }
                if let Some((_, session)) = self.sessions.remove(id)
                    && let Some(mut ids) = self.class_sessions.get_mut(&session.class_id)
                {
                    ids.retain(|s| s != id);
                }
            }
            Event::SessionTeacherSet {
                session_id,
                stored_override,
                effective_teacher_id,
            } => {
                let new_key = TrackKey::Teacher(*effective_teacher_id);
                if let Some(mut keys) = self.booking_tracks.get_mut(session_id) {
                    let old_key = keys
                        .iter()
                        .copied()
                        .find(|k| matches!(k, TrackKey::Teacher(_)));
                    if let Some(old_key) = old_key
                        && old_key != new_key
                        && let Some(entry) = tracks.get_mut(&old_key).remove_entry(*session_id)
                    {
                        tracks.get_mut(&new_key).insert_entry(entry);
                        keys.retain(|k| *k != old_key);
                        keys.push(new_key);
                    }
                }
                if let Some(mut session) = self.sessions.get_mut(session_id) {
                    session.teacher_id = *stored_override;
                }
            }
            Event::TeacherChangeRecorded { change } => {
                self.audit
                    .write()
                    .expect("audit lock poisoned")
                    .push(change.clone());
            }
            Event::AppointmentCreated { appointment } => {
                let key = TrackKey::Teacher(appointment.teacher_id);
                tracks.get_mut(&key).insert_entry(TrackEntry {
                    booking_id: appointment.id,
                    block: appointment.block,
                    kind: BookingKind::Appointment {
                        student_id: appointment.student_id,
                    },
                });
                self.booking_tracks.insert(appointment.id, vec![key]);
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentCancelled { id } => {
                if let Some((_, keys)) = self.booking_tracks.remove(id) {
                    for key in keys {
                        tracks.get_mut(&key).remove_entry(*id);
                    }
                }
                self.appointments.remove(id);
            }
            Event::AppointmentTeacherSet {
                appointment_id,
                teacher_id,
            } => {
                let new_key = TrackKey::Teacher(*teacher_id);
                if let Some(mut keys) = self.booking_tracks.get_mut(appointment_id) {
                    let old_key = keys
                        .iter()
                        .copied()
                        .find(|k| matches!(k, TrackKey::Teacher(_)));
                    if let Some(old_key) = old_key
                        && old_key != new_key
                        && let Some(entry) = tracks.get_mut(&old_key).remove_entry(*appointment_id)
                    {
                        tracks.get_mut(&new_key).insert_entry(entry);
                        keys.retain(|k| *k != old_key);
                        keys.push(new_key);
                    }
                }
                if let Some(mut appointment) = self.appointments.get_mut(appointment_id) {
                    appointment.teacher_id = *teacher_id;
                }
            }
            _ => unreachable!("not a booking event"),
        }
    }

    fn apply_replayed(&self, event: &Event) {
        match event {
            Event::RuleAdded { teacher_id, .. }
            | Event::RuleRemoved { teacher_id, .. }
            | Event::OverrideDaySet { teacher_id, .. }
            | Event::OverrideDayCleared { teacher_id, .. } => {
                let cal = self.calendar_handle(*teacher_id);
                let mut guard = cal.try_write().expect("replay: uncontended write");
                self.apply_calendar_event(event, &mut guard);
            }
            _ => {
                let keys = self.event_track_keys(event);
                let mut tracks = self.write_tracks_uncontended(&keys);
                self.apply_booking_event(event, &mut tracks);
            }
        }
    }

    // ── Rejection bookkeeping ────────────────────────────

    pub(super) fn reject(&self, rejection: Rejection) -> EngineError {
        metrics::counter!(
            crate::observability::REJECTIONS_TOTAL,
            "code" => rejection.code()
        )
        .increment(1);
        tracing::debug!(code = rejection.code(), "rejected: {rejection}");
        EngineError::Rejected(rejection)
    }

    pub(super) fn reject_occurrence(
        &self,
        occurrence: TimeBlock,
        rejection: Rejection,
    ) -> EngineError {
        metrics::counter!(
            crate::observability::REJECTIONS_TOTAL,
            "code" => rejection.code()
        )
        .increment(1);
        tracing::debug!(code = rejection.code(), %occurrence, "occurrence rejected: {rejection}");
        EngineError::OccurrenceRejected { occurrence, rejection }
    }

    // ── WAL compaction ───────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current
    /// state: calendars, then live bookings in final placement, then the
    /// audit trail.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.calendars.iter() {
            let cal = entry.value().clone();
            let guard = cal.try_read().expect("compact: uncontended read");
            for rule in guard.rules() {
                events.push(Event::RuleAdded {
                    id: rule.id,
                    teacher_id: rule.teacher_id,
                    weekday: rule.weekday,
                    span: rule.span,
                });
            }
            for (date, slots) in guard.override_days() {
                events.push(Event::OverrideDaySet {
                    teacher_id: guard.teacher_id,
                    date,
                    slots: slots.to_vec(),
                });
            }
        }

        for entry in self.sessions.iter() {
            let session = entry.value().clone();
            let keys = self
                .booking_tracks
                .get(&session.id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            let effective_teacher_id = keys
                .iter()
                .find_map(|k| match k {
                    TrackKey::Teacher(id) => Some(*id),
                    TrackKey::Room(_) => None,
                })
                .expect("compact: session without a teacher track");
            let room_id = keys.iter().find_map(|k| match k {
                TrackKey::Room(id) => Some(*id),
                TrackKey::Teacher(_) => None,
            });
            events.push(Event::SessionCreated {
                session,
                effective_teacher_id,
                room_id,
            });
        }

        for entry in self.appointments.iter() {
            events.push(Event::AppointmentCreated {
                appointment: entry.value().clone(),
            });
        }

        for change in self.audit.read().expect("audit lock poisoned").iter() {
            events.push(Event::TeacherChangeRecorded {
                change: change.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }
}
