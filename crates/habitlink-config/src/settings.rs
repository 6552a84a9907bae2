//! Validated configuration structures

use crate::schema::{RawConfig, RawReminderConfig, RawSchedulerConfig, RawServiceConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Default upper bound for a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default recurrence cadence: once a day
pub const DEFAULT_RECURRENCE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default reminder scan cadence: hourly
pub const DEFAULT_REMINDER_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default leaderboard size
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 15;

/// Validated configuration ready for use by the service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: ServiceSettings,
    pub scheduler: SchedulerSettings,
    pub reschedule: ReschedulePolicy,
    pub leaderboard_limit: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            scheduler: SchedulerSettings::default(),
            reschedule: ReschedulePolicy::default(),
            leaderboard_limit: DEFAULT_LEADERBOARD_LIMIT,
        }
    }
}

impl ServiceConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceSettings::from_raw(raw.service),
            scheduler: SchedulerSettings::from_raw(raw.scheduler),
            reschedule: ReschedulePolicy::from_raw(&raw.reminders),
            leaderboard_limit: raw.leaderboard.limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT),
        }
    }
}

/// Paths and store limits
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub store_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

impl ServiceSettings {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw
                .socket_path
                .unwrap_or_else(habitlink_util::default_socket_path),
            data_dir: raw.data_dir.unwrap_or_else(habitlink_util::default_data_dir),
            store_timeout: raw
                .store_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STORE_TIMEOUT),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(habitlink_util::DATABASE_FILENAME)
    }
}

/// Cadence of the two batch jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub recurrence_interval: Duration,
    pub reminder_interval: Duration,
    pub autostart: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            recurrence_interval: DEFAULT_RECURRENCE_INTERVAL,
            reminder_interval: DEFAULT_REMINDER_INTERVAL,
            autostart: true,
        }
    }
}

impl SchedulerSettings {
    fn from_raw(raw: RawSchedulerConfig) -> Self {
        let defaults = Self::default();
        Self {
            recurrence_interval: raw
                .recurrence_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.recurrence_interval),
            reminder_interval: raw
                .reminder_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.reminder_interval),
            autostart: raw.autostart.unwrap_or(defaults.autostart),
        }
    }
}

/// How a surfaced reminder's next due-time is chosen.
///
/// One policy applies to every habit of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReschedulePolicy {
    /// Next due-time derived from the habit's frequency
    #[default]
    Frequency,
    /// Next due-time a fixed interval after the scan
    Fixed(Duration),
}

impl ReschedulePolicy {
    fn from_raw(raw: &RawReminderConfig) -> Self {
        match (raw.reschedule.as_deref(), raw.fixed_interval_seconds) {
            (Some("fixed"), Some(secs)) => ReschedulePolicy::Fixed(Duration::from_secs(secs)),
            _ => ReschedulePolicy::Frequency,
        }
    }
}
