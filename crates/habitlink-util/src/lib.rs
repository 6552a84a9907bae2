//! Shared utilities for habitlink
//!
//! This crate provides:
//! - ID types (HabitId, UserId, ClientId)
//! - Time utilities (injectable time source, UTC period arithmetic)
//! - Error types
//! - Rate limiting helpers
//! - Default paths for socket, data, and config

mod error;
mod ids;
mod paths;
mod rate_limit;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use rate_limit::*;
pub use time::*;
