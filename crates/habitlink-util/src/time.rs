//! Time utilities for habitlink
//!
//! All instants handled by habitlink are UTC. Reminder due-times such as
//! "18:00" are 18:00 UTC.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `HABITLINK_MOCK_TIME` environment variable can be set
//! to override the system time for everything that reads the clock through
//! [`now`] or [`SystemClock`]. This is useful for watching daily/weekly
//! recurrence and reminder scans without waiting for real days to pass.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (UTC, e.g. `2025-12-25 17:59:30`)
//!
//! Example:
//! ```bash
//! HABITLINK_MOCK_TIME="2025-12-25 17:59:30" habitlinkd
//! ```

use chrono::{DateTime, Days, Months, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "HABITLINK_MOCK_TIME";

/// Format accepted in [`MOCK_TIME_ENV_VAR`]
pub const MOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Offset between mock time and real time, computed once per process
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // wraps Utc::now()
fn mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            let raw = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
            match parse_mock_time(&raw) {
                Some(mock) => {
                    let offset = mock.signed_duration_since(Utc::now());
                    tracing::info!(
                        mock_time = %raw,
                        offset_secs = offset.num_seconds(),
                        "Mock time enabled"
                    );
                    Some(offset)
                }
                None => {
                    tracing::warn!(
                        mock_time = %raw,
                        expected_format = MOCK_TIME_FORMAT,
                        "Invalid mock time format"
                    );
                    None
                }
            }
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Parse a mock time string as a UTC instant
pub fn parse_mock_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), MOCK_TIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    mock_time_offset().is_some()
}

/// Current UTC time, respecting `HABITLINK_MOCK_TIME` in debug builds.
#[allow(clippy::disallowed_methods)] // the one sanctioned clock read
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();
    match mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Source of the current instant.
///
/// The lifecycle engine never reads the clock itself; the scheduler asks
/// a `TimeSource` and passes the instant down.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock (mock-time aware)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        now()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug)]
pub struct FixedClock {
    instant: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Mutex::new(instant),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.instant.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.instant.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl TimeSource for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.instant.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Same UTC calendar day as `instant`, at `hour:00:00`.
///
/// Returns `None` for an hour outside 0..24.
pub fn at_utc_hour(instant: DateTime<Utc>, hour: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, 0, 0)?;
    Some(Utc.from_utc_datetime(&instant.date_naive().and_time(time)))
}

/// Add whole days, `None` on overflow
pub fn add_days(instant: DateTime<Utc>, days: u64) -> Option<DateTime<Utc>> {
    instant.checked_add_days(Days::new(days))
}

/// Add calendar months, clamping the day to the end of the target month.
///
/// Jan 31 + 1 month is Feb 28 (Feb 29 in leap years); the time of day is
/// kept. `None` on overflow.
pub fn add_months_clamped(instant: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    instant.checked_add_months(Months::new(months))
}

/// RFC 3339 with second precision, the on-disk representation of instants
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 instant in any offset and normalize it to UTC
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
