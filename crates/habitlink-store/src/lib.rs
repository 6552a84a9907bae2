//! Persistence layer for habitlink
//!
//! Provides:
//! - Live habits with guarded (conditional) updates
//! - Past habits, keyed by the archived habit's id
//! - Per-user counters and badges
//! - Audit log (append-only)

mod audit;
mod memory;
mod sqlite;
mod traits;

pub use audit::*;
pub use memory::*;
pub use sqlite::*;
pub use traits::*;

use habitlink_util::HabitError;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Injected failure: {0}")]
    Injected(&'static str),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for HabitError {
    fn from(e: StoreError) -> Self {
        HabitError::Store(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
