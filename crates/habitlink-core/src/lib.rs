//! Habit lifecycle engine for habitlink
//!
//! This crate is the heart of habitlinkd, containing:
//! - Reminder calculation (next 18:00 UTC due-time per frequency)
//! - Recurrence (reset stale habits in place, recreate completed ones)
//! - Reminder scanning with atomic read-then-advance per habit
//! - Progress updates and archival
//! - The scheduler that drives the two batch jobs

mod bounded;
mod engine;
mod recurrence;
mod reminder;
mod scanner;
mod scheduler;

pub use bounded::*;
pub use engine::*;
pub use recurrence::*;
pub use reminder::*;
pub use scanner::*;
pub use scheduler::*;
