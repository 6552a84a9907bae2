//! Record and protocol types for habitlink
//!
//! This crate defines the habit records shared by every layer and the
//! stable API between habitlinkd and its clients:
//! - Records (Habit, PastHabit, UserStats)
//! - Commands (requests from clients) and responses
//! - Events (service -> clients)
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
