use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, Weekday};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{EngineError, Rejection};
use super::Engine;

/// Per-run handling of conflicting occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// First conflict aborts the whole batch; nothing is written.
    Reject,
    /// Conflicts are recorded and excluded; the rest is created.
    Skip,
}

/// Inclusive date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        debug_assert!(from <= to, "DateRange from must not follow to");
        Self { from, to }
    }

    /// The window covering `weeks` weeks starting at `start`.
    pub fn weeks_from(start: NaiveDate, weeks: u32) -> Self {
        let to = start + chrono::Duration::days(i64::from(weeks) * 7 - 1);
        Self { from: start, to }
    }

    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    pub fn iter_dates(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        std::iter::successors(Some(self.from), |d| d.succ_opt()).take_while(move |d| *d <= to)
    }
}

/// Weekly recurrence: same weekday, same time, every week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyPattern {
    pub weekday: Weekday,
    pub start_min: Minutes,
    pub duration_min: Minutes,
}

impl WeeklyPattern {
    pub fn from_template(template: &RecurrenceTemplate) -> Self {
        Self {
            weekday: weekday_from_num(template.weekday),
            start_min: template.start_min,
            duration_min: template.duration_min,
        }
    }

    fn span(&self) -> MinuteSpan {
        MinuteSpan::new(self.start_min, self.start_min + self.duration_min)
    }
}

/// Expand a weekly pattern into chronological concrete occurrences.
pub fn expand_weekly(pattern: &WeeklyPattern, range: &DateRange) -> Vec<TimeBlock> {
    let span = pattern.span();
    range
        .iter_dates()
        .filter(|date| date.weekday() == pattern.weekday)
        .map(|date| TimeBlock::new(date, span))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedOccurrence {
    pub occurrence: TimeBlock,
    pub rejection: Rejection,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub created: Vec<Session>,
    /// Sampled reasons, capped at `SKIP_REPORT_SAMPLE`; `skipped_total`
    /// counts every skip.
    pub skipped: Vec<SkippedOccurrence>,
    pub skipped_total: usize,
    pub total: usize,
}

impl Engine {
    /// Expand `pattern` across `range` and create the occurrences that
    /// pass validation, under the given conflict policy. All creations
    /// commit as one WAL batch while the involved tracks stay locked, so
    /// a crash cannot leave a silently partial series.
    pub async fn generate_batch(
        &self,
        class_id: Ulid,
        pattern: &WeeklyPattern,
        range: &DateRange,
        policy: ConflictPolicy,
        student_id: Option<Ulid>,
    ) -> Result<BatchOutcome, EngineError> {
        if range.days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        if pattern.duration_min == 0
            || pattern.duration_min > MINUTES_PER_DAY
            || pattern.start_min > MINUTES_PER_DAY - pattern.duration_min
        {
            return Err(EngineError::LimitExceeded("pattern must stay within one day"));
        }
        let refs = self.resolve_refs(class_id, None).map_err(|r| self.reject(r))?;
        let student_id = if refs.class.is_one_on_one() {
            student_id
        } else {
            None
        };

        let occurrences = expand_weekly(pattern, range);
        metrics::counter!(
            crate::observability::BATCH_RUNS_TOTAL,
            "policy" => match policy {
                ConflictPolicy::Reject => "reject",
                ConflictPolicy::Skip => "skip",
            }
        )
        .increment(1);
        if occurrences.is_empty() {
            return Ok(BatchOutcome::default());
        }
        if occurrences.len() > MAX_BATCH_OCCURRENCES {
            return Err(EngineError::LimitExceeded("too many occurrences in batch"));
        }

        let keys = refs.track_keys();
        let mut tracks = self.write_tracks(&keys).await;
        let calendar = self.calendar_get(refs.teacher.id);
        let cal_guard = match &calendar {
            Some(cal) => Some(cal.read().await),
            None => None,
        };
        let teacher_key = TrackKey::Teacher(refs.teacher.id);
        let room_key = refs.room.as_ref().map(|r| TrackKey::Room(r.id));

        // Phase 1: validate chronologically against current state and the
        // batch's own accepted occurrences.
        let total = occurrences.len();
        let mut accepted: Vec<(Session, Event)> = Vec::new();
        let mut skipped = Vec::new();
        let mut skipped_total = 0usize;
        for block in occurrences {
            metrics::counter!(crate::observability::VALIDATIONS_TOTAL).increment(1);
            let in_batch_conflict = accepted
                .iter()
                .find(|(s, _)| s.block.overlaps(&block))
                .map(|(s, _)| Rejection::Duplicate { session_id: s.id });
            let verdict = match in_batch_conflict {
                Some(rejection) => Err(rejection),
                None => self.run_booking_checks(
                    &refs,
                    &block,
                    student_id,
                    tracks.get(&teacher_key),
                    room_key.and_then(|k| tracks.get(&k)),
                    cal_guard.as_deref(),
                    &HashSet::new(),
                ),
            };
            match verdict {
                Ok(()) => {
                    let session = Session {
                        id: Ulid::new(),
                        class_id: refs.class.id,
                        block,
                        teacher_id: None,
                        student_id,
                    };
                    let event = Event::SessionCreated {
                        session: session.clone(),
                        effective_teacher_id: refs.teacher.id,
                        room_id: refs.class.room_id,
                    };
                    accepted.push((session, event));
                }
                Err(rejection) => match policy {
                    ConflictPolicy::Reject => {
                        return Err(self.reject_occurrence(block, rejection));
                    }
                    ConflictPolicy::Skip => {
                        skipped_total += 1;
                        metrics::counter!(crate::observability::BATCH_SKIPPED_TOTAL).increment(1);
                        if skipped.len() < SKIP_REPORT_SAMPLE {
                            skipped.push(SkippedOccurrence {
                                occurrence: block,
                                rejection,
                            });
                        }
                    }
                },
            }
        }

        // Phase 2: all validated — commit everything in one WAL batch.
        if !accepted.is_empty() {
            let events: Vec<Event> = accepted.iter().map(|(_, e)| e.clone()).collect();
            self.wal_append_batch(&events).await?;
            for event in &events {
                self.apply_booking_event(event, &mut tracks);
                self.feed.publish(refs.teacher.id, event);
            }
            metrics::counter!(crate::observability::SESSIONS_CREATED_TOTAL)
                .increment(events.len() as u64);
        }

        let created: Vec<Session> = accepted.into_iter().map(|(s, _)| s).collect();
        tracing::info!(
            class = %class_id,
            created = created.len(),
            skipped = skipped_total,
            total,
            "batch generated"
        );
        Ok(BatchOutcome {
            created,
            skipped,
            skipped_total,
            total,
        })
    }

    /// Expand a stored weekly one-on-one template. The template's student
    /// must be enrolled in its bucket class, mirroring the validator's
    /// one-on-one checks.
    pub async fn generate_from_template(
        &self,
        template: &RecurrenceTemplate,
        range: &DateRange,
        policy: ConflictPolicy,
    ) -> Result<BatchOutcome, EngineError> {
        if !self
            .services
            .enrollment
            .is_enrolled(template.student_id, template.class_id)
        {
            return Err(self.reject(Rejection::NotEnrolled {
                student_id: template.student_id,
                class_id: template.class_id,
            }));
        }
        let pattern = WeeklyPattern::from_template(template);
        self.generate_batch(template.class_id, &pattern, range, policy, Some(template.student_id))
            .await
    }
}
