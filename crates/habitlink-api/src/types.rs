//! Shared record types for habitlink

use chrono::{DateTime, Utc};
use habitlink_util::{ClientId, HabitError, HabitId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How often a habit's tracking period rolls over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub const ALL: [Frequency; 3] = [Frequency::Daily, Frequency::Weekly, Frequency::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }

    /// End of the tracking period that started at `start`.
    ///
    /// Daily and weekly periods are 1 and 7 days. Monthly periods use
    /// calendar months with the day clamped to the end of the target month
    /// (Jan 31 -> Feb 28/29). `None` if the result is out of range.
    pub fn period_end(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Frequency::Daily => habitlink_util::add_days(start, 1),
            Frequency::Weekly => habitlink_util::add_days(start, 7),
            Frequency::Monthly => habitlink_util::add_months_clamped(start, 1),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = HabitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            _ => Err(HabitError::invalid_frequency(s)),
        }
    }
}

/// A recurring, goal-tracked activity owned by one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    pub id: HabitId,
    pub name: String,
    pub goal: f64,
    pub unit: Option<String>,
    pub frequency: Frequency,
    pub progress: f64,
    pub completed: bool,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    /// Start of the current tracking period
    pub last_reset: DateTime<Utc>,
    /// Next reminder due-time; cleared once a completed habit stops reminding
    pub reminder_time: Option<DateTime<Utc>>,
}

impl Habit {
    /// A fresh habit whose first period starts at `created_at`
    pub fn new(
        owner_id: UserId,
        name: impl Into<String>,
        goal: f64,
        unit: Option<String>,
        frequency: Frequency,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: HabitId::new(),
            name: name.into(),
            goal,
            unit,
            frequency,
            progress: 0.0,
            completed: false,
            owner_id,
            created_at,
            last_reset: created_at,
            reminder_time: None,
        }
    }

    pub fn with_reminder(mut self, at: DateTime<Utc>) -> Self {
        self.reminder_time = Some(at);
        self
    }

    /// When the current tracking period ends
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        self.frequency.period_end(self.last_reset)
    }

    /// Amount still missing to reach the goal (never negative)
    pub fn remaining(&self) -> f64 {
        (self.goal - self.progress).max(0.0)
    }

    pub fn goal_reached(&self) -> bool {
        self.progress >= self.goal
    }
}

/// Immutable archival copy of a finished habit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastHabit {
    #[serde(flatten)]
    pub habit: Habit,
    pub archived_at: DateTime<Utc>,
}

impl PastHabit {
    pub fn new(habit: Habit, archived_at: DateTime<Utc>) -> Self {
        Self { habit, archived_at }
    }

    pub fn id(&self) -> HabitId {
        self.habit.id
    }
}

/// Signed progress intent: a direction plus a positive magnitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "amount", rename_all = "snake_case")]
pub enum ProgressDelta {
    Increment(f64),
    Decrement(f64),
}

impl ProgressDelta {
    pub fn magnitude(&self) -> f64 {
        match self {
            ProgressDelta::Increment(m) | ProgressDelta::Decrement(m) => *m,
        }
    }

    /// Apply to a progress value. Decrements floor at zero; increments are
    /// not capped at the goal.
    pub fn apply(&self, progress: f64) -> f64 {
        match self {
            ProgressDelta::Increment(m) => progress + m,
            ProgressDelta::Decrement(m) => (progress - m).max(0.0),
        }
    }
}

/// Caller-supplied fields for a new habit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHabit {
    pub name: String,
    pub goal: f64,
    /// Raw frequency string; parsed into [`Frequency`] by the engine
    pub frequency: String,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Per-user counters kept by the users collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: UserId,
    pub habits_finished: u64,
    #[serde(default)]
    pub badges_collected: BTreeSet<String>,
}

impl UserStats {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            habits_finished: 0,
            badges_collected: BTreeSet::new(),
        }
    }
}

/// One row of the individual leaderboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub habits_finished: u64,
}

/// Action the recurrence engine took for one habit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecurrenceAction {
    /// Progress zeroed in place, id unchanged
    Reset,
    /// Replaced by a fresh habit with a new id
    Recreated { new_id: HabitId },
}

/// Result of one recurrence decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceOutcome {
    pub habit_id: HabitId,
    pub owner_id: UserId,
    pub action: RecurrenceAction,
}

/// A reminder surfaced by a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DueReminder {
    pub habit_id: HabitId,
    pub owner_id: UserId,
    pub message: String,
    pub next_reminder: DateTime<Utc>,
}

impl fmt::Display for DueReminder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Scheduler status as reported over IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub recurrence_in_flight: bool,
    pub reminders_in_flight: bool,
    pub last_recurrence_at: Option<DateTime<Utc>>,
    pub last_reminder_scan_at: Option<DateTime<Utc>>,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_healthy: bool,
    pub scheduler: SchedulerStatus,
}

/// Client role, derived from the peer's credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Regular caller acting on behalf of users
    Member,
    /// Operator; may trigger scheduler jobs by hand
    Admin,
}

impl ClientRole {
    pub fn can_run_jobs(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn frequency_parses_known_values_only() {
        assert_eq!("daily".parse::<Frequency>().unwrap(), Frequency::Daily);
        assert_eq!(" Weekly ".parse::<Frequency>().unwrap(), Frequency::Weekly);
        assert_eq!("MONTHLY".parse::<Frequency>().unwrap(), Frequency::Monthly);

        let err = "hourly".parse::<Frequency>().unwrap_err();
        assert!(matches!(err, HabitError::InvalidFrequency(v) if v == "hourly"));
    }

    #[test]
    fn frequency_rejects_unknown_values_when_deserializing() {
        assert!(serde_json::from_str::<Frequency>("\"daily\"").is_ok());
        assert!(serde_json::from_str::<Frequency>("\"fortnightly\"").is_err());
    }

    #[test]
    fn period_lengths() {
        let start = utc(2024, 1, 31, 8);
        assert_eq!(Frequency::Daily.period_end(start), Some(utc(2024, 2, 1, 8)));
        assert_eq!(Frequency::Weekly.period_end(start), Some(utc(2024, 2, 7, 8)));
        assert_eq!(Frequency::Monthly.period_end(start), Some(utc(2024, 2, 29, 8)));
    }

    #[test]
    fn new_habit_starts_its_period_at_creation() {
        let created = utc(2024, 5, 1, 9);
        let habit = Habit::new(
            UserId::new("u1"),
            "Run",
            5.0,
            Some("miles".into()),
            Frequency::Weekly,
            created,
        );

        assert_eq!(habit.last_reset, created);
        assert_eq!(habit.progress, 0.0);
        assert!(!habit.completed);
        assert_eq!(habit.next_occurrence(), Some(utc(2024, 5, 8, 9)));
    }

    #[test]
    fn delta_application() {
        assert_eq!(ProgressDelta::Increment(3.0).apply(4.0), 7.0);
        assert_eq!(ProgressDelta::Decrement(10.0).apply(2.0), 0.0);
        assert_eq!(ProgressDelta::Decrement(1.5).apply(2.0), 0.5);
    }

    #[test]
    fn habit_serializes_in_camel_case() {
        let habit = Habit::new(
            UserId::new("u1"),
            "Read",
            30.0,
            Some("pages".into()),
            Frequency::Daily,
            utc(2024, 1, 1, 0),
        );
        let json = serde_json::to_value(&habit).unwrap();

        assert_eq!(json["ownerId"], "u1");
        assert_eq!(json["frequency"], "daily");
        assert!(json.get("lastReset").is_some());
        assert!(json["reminderTime"].is_null());
    }

    #[test]
    fn past_habit_flattens_the_habit_record() {
        let habit = Habit::new(UserId::new("u1"), "Read", 30.0, None, Frequency::Daily, utc(2024, 1, 1, 0));
        let past = PastHabit::new(habit.clone(), utc(2024, 1, 2, 0));
        let json = serde_json::to_value(&past).unwrap();

        assert_eq!(json["name"], "Read");
        assert!(json.get("archivedAt").is_some());

        let back: PastHabit = serde_json::from_value(json).unwrap();
        assert_eq!(back.habit, habit);
    }
}
