//! Engine bounds — guard rails that keep a single request's work and a
//! single report's size finite. None of these change scheduling logic;
//! they only reject pathological inputs with [`EngineError::LimitExceeded`].
//!
//! [`EngineError::LimitExceeded`]: crate::engine::EngineError::LimitExceeded

/// Widest date window any query/batch/slot scan will accept, in days
/// (inclusive). One year plus a day covers a full annual schedule.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

/// Maximum number of occurrences a single batch may expand to.
pub const MAX_BATCH_OCCURRENCES: usize = 1_024;

/// How many rejected occurrences a batch report samples; the full count
/// is always reported separately as `skipped_total`.
pub const SKIP_REPORT_SAMPLE: usize = 10;

/// Maximum length of a free-text reassignment reason, in bytes.
pub const MAX_REASON_LEN: usize = 1_024;

/// Maximum number of recurring weekly rules held for one teacher.
pub const MAX_RULES_PER_TEACHER: usize = 512;

/// Maximum number of override slots accepted for one teacher-day.
pub const MAX_OVERRIDE_SLOTS_PER_DAY: usize = 48;

/// Maximum number of slot candidates a single scan will materialise.
pub const MAX_SLOT_CANDIDATES: usize = 100_000;
