//! Per-collection cache policy enforcement
//!
//! The sweep purges expired payload; the interval check keeps collections
//! fresh. Both run on a coarse timetable built from effective policies.

mod cleaner;
mod interval;
mod timetable;

pub use cleaner::{CLEANER_SESSION, CacheCleaner, SweepStats};
pub use interval::{IntervalChecker, cooldown_elapsed};
pub use timetable::CollectionTimetable;
