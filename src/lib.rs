//! rota — scheduling conflict-resolution and availability engine for a
//! tutoring-center back office.
//!
//! The engine decides whether a proposed teacher/room/time booking is
//! legal and batch-generates recurring bookings while enforcing that
//! legality. State is held in per-teacher and per-room booking tracks
//! behind their own locks, every mutation is an event appended to a
//! group-committed WAL, and validation always re-runs inside the same
//! locked scope as the write. Reference data, enrollment, billing, and
//! slot curation are external collaborators reached through the traits
//! in [`directory`].

pub mod clock;
pub mod directory;
pub mod engine;
mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;

pub use clock::{Clock, FixedClock, SystemClock};
pub use directory::{CurationStore, Directory, EnrollmentStore, PackageLedger};
pub use engine::{
    BatchOutcome, BookingCandidate, ConflictPolicy, DateRange, Engine, EngineError,
    ReassignScope, Rejection, Services, SkippedOccurrence, SlotCandidate, WeeklyPattern,
};
pub use notify::ChangeFeed;
