//! Error types for habitlink

use std::time::Duration;
use thiserror::Error;

use crate::HabitId;

/// Core error type for habit lifecycle operations
#[derive(Debug, Error)]
pub enum HabitError {
    #[error("Invalid frequency: {0}")]
    InvalidFrequency(String),

    #[error("Invalid progress delta: {0}")]
    InvalidDelta(String),

    #[error("Habit not found: {0}")]
    NotFound(HabitId),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store call timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Scheduler already running")]
    AlreadyRunning,

    #[error("Scheduler not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HabitError {
    pub fn invalid_frequency(value: impl Into<String>) -> Self {
        Self::InvalidFrequency(value.into())
    }

    pub fn invalid_delta(msg: impl Into<String>) -> Self {
        Self::InvalidDelta(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient persistence failures; the caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::StoreTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, HabitError>;
