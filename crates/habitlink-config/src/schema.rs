//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service-level settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Batch job cadence
    #[serde(default)]
    pub scheduler: RawSchedulerConfig,

    /// Reminder rescheduling
    #[serde(default)]
    pub reminders: RawReminderConfig,

    #[serde(default)]
    pub leaderboard: RawLeaderboardConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,

    /// Upper bound for a single store call
    pub store_timeout_seconds: Option<u64>,
}

/// Scheduler cadence
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSchedulerConfig {
    /// How often the recurrence engine scans all habits
    pub recurrence_interval_seconds: Option<u64>,

    /// How often the global reminder scan runs
    pub reminder_interval_seconds: Option<u64>,

    /// Start the scheduler when the service boots
    pub autostart: Option<bool>,
}

/// Reminder rescheduling
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawReminderConfig {
    /// "frequency" or "fixed"
    pub reschedule: Option<String>,

    /// Interval used by the "fixed" mode
    pub fixed_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawLeaderboardConfig {
    /// Default number of rows
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
            config_version = 1

            [service]
            socket_path = "/tmp/habitlink-test/habitlinkd.sock"
            store_timeout_seconds = 2

            [scheduler]
            recurrence_interval_seconds = 86400
            reminder_interval_seconds = 3600
            autostart = false

            [reminders]
            reschedule = "fixed"
            fixed_interval_seconds = 900

            [leaderboard]
            limit = 10
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.store_timeout_seconds, Some(2));
        assert_eq!(config.scheduler.autostart, Some(false));
        assert_eq!(config.reminders.reschedule.as_deref(), Some("fixed"));
        assert_eq!(config.leaderboard.limit, Some(10));
    }

    #[test]
    fn sections_are_optional() {
        let config: RawConfig = toml::from_str("config_version = 1").unwrap();
        assert!(config.service.socket_path.is_none());
        assert!(config.scheduler.recurrence_interval_seconds.is_none());
        assert!(config.reminders.reschedule.is_none());
    }
}
