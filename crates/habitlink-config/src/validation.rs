//! Configuration validation

use crate::schema::RawConfig;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("Unknown reschedule mode '{0}' (expected \"frequency\" or \"fixed\")")]
    UnknownRescheduleMode(String),

    #[error("reminders.fixed_interval_seconds is required when reschedule = \"fixed\"")]
    MissingFixedInterval,

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Recognized values of `reminders.reschedule`
pub const RESCHEDULE_MODES: [&str; 2] = ["frequency", "fixed"];

/// Validate a raw configuration, collecting every problem
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let positive = [
        ("service.store_timeout_seconds", config.service.store_timeout_seconds),
        (
            "scheduler.recurrence_interval_seconds",
            config.scheduler.recurrence_interval_seconds,
        ),
        (
            "scheduler.reminder_interval_seconds",
            config.scheduler.reminder_interval_seconds,
        ),
        (
            "reminders.fixed_interval_seconds",
            config.reminders.fixed_interval_seconds,
        ),
    ];
    for (field, value) in positive {
        if value == Some(0) {
            errors.push(ValidationError::NotPositive { field });
        }
    }

    if config.leaderboard.limit == Some(0) {
        errors.push(ValidationError::NotPositive {
            field: "leaderboard.limit",
        });
    }

    if let Some(mode) = &config.reminders.reschedule {
        if !RESCHEDULE_MODES.contains(&mode.as_str()) {
            errors.push(ValidationError::UnknownRescheduleMode(mode.clone()));
        } else if mode == "fixed" && config.reminders.fixed_interval_seconds.is_none() {
            errors.push(ValidationError::MissingFixedInterval);
        }
    }

    if let Some(path) = &config.service.socket_path
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::GlobalError(
            "service.socket_path cannot be empty".into(),
        ));
    }

    errors
}
