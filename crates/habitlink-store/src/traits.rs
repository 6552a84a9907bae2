//! Store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use habitlink_api::{Habit, LeaderboardEntry, PastHabit, UserStats};
use habitlink_util::{HabitId, UserId};

use crate::{AuditEvent, StoreResult};

/// Main store trait.
///
/// Every mutation of a live habit goes through [`HabitStore::update_habit`]
/// with a [`HabitGuard`], so a writer only wins when the fields it read are
/// still current. The returned count is the number of records matched.
#[async_trait]
pub trait HabitStore: Send + Sync {
    // Live habits

    async fn find_habits(&self, filter: &HabitFilter) -> StoreResult<Vec<Habit>>;

    async fn insert_habit(&self, habit: &Habit) -> StoreResult<HabitId>;

    /// Apply `patch` to the habit if it exists and `guard` holds
    async fn update_habit(
        &self,
        id: &HabitId,
        guard: &HabitGuard,
        patch: &HabitPatch,
    ) -> StoreResult<u64>;

    async fn delete_habit(&self, id: &HabitId) -> StoreResult<u64>;

    /// Swap `old_id` for `fresh` atomically. Returns `false`, with nothing
    /// written, when the old habit is gone or `guard` no longer holds.
    async fn replace_habit(
        &self,
        old_id: &HabitId,
        guard: &HabitGuard,
        fresh: &Habit,
    ) -> StoreResult<bool>;

    // Past habits

    /// Insert an archival copy; an existing row with the same id is kept
    async fn insert_past_habit(&self, past: &PastHabit) -> StoreResult<HabitId>;

    /// Archive in one transaction: insert the past habit (if new), bump the
    /// owner's finished counter only when it was new, delete the live habit.
    async fn archive_habit(&self, past: &PastHabit) -> StoreResult<ArchiveOutcome>;

    async fn list_past_habits(&self, owner: &UserId) -> StoreResult<Vec<PastHabit>>;

    // Users

    async fn increment_user_counter(
        &self,
        user: &UserId,
        counter: UserCounter,
        by: i64,
    ) -> StoreResult<()>;

    /// Stats for a user; an unknown user has empty stats
    async fn user_stats(&self, user: &UserId) -> StoreResult<UserStats>;

    /// Users with at least one finished habit, most first
    async fn top_users(&self, limit: usize) -> StoreResult<Vec<LeaderboardEntry>>;

    /// Add a badge to the user's set. Returns false if already present.
    async fn add_badge(&self, user: &UserId, badge_id: &str) -> StoreResult<bool>;

    // Audit log

    async fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    async fn recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    async fn is_healthy(&self) -> bool;
}

/// Selection criteria for live habits. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HabitFilter {
    pub id: Option<HabitId>,
    pub owner: Option<UserId>,
    pub completed: Option<bool>,
    /// Only habits whose reminder is set and due at or before this instant
    pub reminder_due_at: Option<DateTime<Utc>>,
}

impl HabitFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: HabitId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_owner(owner: UserId) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    pub fn reminders_due(at: DateTime<Utc>) -> Self {
        Self {
            reminder_due_at: Some(at),
            ..Self::default()
        }
    }

    pub fn owned_by(mut self, owner: UserId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn matches(&self, habit: &Habit) -> bool {
        if self.id.is_some_and(|id| id != habit.id) {
            return false;
        }
        if self.owner.as_ref().is_some_and(|o| *o != habit.owner_id) {
            return false;
        }
        if self.completed.is_some_and(|c| c != habit.completed) {
            return false;
        }
        if let Some(at) = self.reminder_due_at {
            return habit.reminder_time.is_some_and(|t| t <= at);
        }
        true
    }
}

/// Field values an update requires to still hold
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HabitGuard {
    pub owner: Option<UserId>,
    pub last_reset: Option<DateTime<Utc>>,
    pub progress: Option<f64>,
    pub completed: Option<bool>,
    /// `Some(None)` requires the reminder to be cleared
    pub reminder_time: Option<Option<DateTime<Utc>>>,
}

impl HabitGuard {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: UserId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn last_reset(mut self, at: DateTime<Utc>) -> Self {
        self.last_reset = Some(at);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn reminder_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.reminder_time = Some(at);
        self
    }

    pub fn holds(&self, habit: &Habit) -> bool {
        self.owner.as_ref().is_none_or(|o| *o == habit.owner_id)
            && self.last_reset.is_none_or(|t| t == habit.last_reset)
            && self.progress.is_none_or(|p| p == habit.progress)
            && self.completed.is_none_or(|c| c == habit.completed)
            && self.reminder_time.is_none_or(|t| t == habit.reminder_time)
    }
}

/// Partial update of the mutable habit fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HabitPatch {
    pub progress: Option<f64>,
    pub completed: Option<bool>,
    pub last_reset: Option<DateTime<Utc>>,
    /// `Some(None)` clears the reminder
    pub reminder_time: Option<Option<DateTime<Utc>>>,
}

impl HabitPatch {
    /// New period: progress back to zero, period restarts at `now`
    pub fn reset(now: DateTime<Utc>) -> Self {
        Self {
            progress: Some(0.0),
            last_reset: Some(now),
            ..Self::default()
        }
    }

    pub fn progress(progress: f64, completed: bool) -> Self {
        Self {
            progress: Some(progress),
            completed: Some(completed),
            ..Self::default()
        }
    }

    pub fn reminder(at: Option<DateTime<Utc>>) -> Self {
        Self {
            reminder_time: Some(at),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.progress.is_none()
            && self.completed.is_none()
            && self.last_reset.is_none()
            && self.reminder_time.is_none()
    }

    pub fn apply_to(&self, habit: &mut Habit) {
        if let Some(progress) = self.progress {
            habit.progress = progress;
        }
        if let Some(completed) = self.completed {
            habit.completed = completed;
        }
        if let Some(last_reset) = self.last_reset {
            habit.last_reset = last_reset;
        }
        if let Some(reminder_time) = self.reminder_time {
            habit.reminder_time = reminder_time;
        }
    }
}

/// Numeric per-user counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCounter {
    HabitsFinished,
}

impl UserCounter {
    pub fn column(&self) -> &'static str {
        match self {
            UserCounter::HabitsFinished => "habits_finished",
        }
    }
}

/// What an archive call changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveOutcome {
    /// A past habit row was written by this call
    pub newly_archived: bool,
    /// Live habit records deleted by this call
    pub removed: u64,
}
