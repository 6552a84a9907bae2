//! Caller-facing habit operations

use habitlink_api::{
    Frequency, Habit, LeaderboardEntry, NewHabit, PastHabit, ProgressDelta, UserStats,
};
use habitlink_store::{AuditEventType, HabitFilter, HabitGuard, HabitPatch};
use habitlink_util::{HabitError, HabitId, Result, TimeSource, UserId};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{compute_next_reminder, BoundedStore};

/// Attempts at a guarded progress write before giving up
const MAX_PROGRESS_ATTEMPTS: usize = 3;

/// Habit creation, progress, archival and the read-side queries.
///
/// Every operation either takes full effect or leaves the store unchanged.
pub struct HabitEngine {
    store: BoundedStore,
    clock: Arc<dyn TimeSource>,
    leaderboard_limit: usize,
}

impl HabitEngine {
    pub fn new(store: BoundedStore, clock: Arc<dyn TimeSource>, leaderboard_limit: usize) -> Self {
        info!(leaderboard_limit, "Habit engine initialized");
        Self {
            store,
            clock,
            leaderboard_limit,
        }
    }

    pub fn store(&self) -> &BoundedStore {
        &self.store
    }

    /// Validate and persist a new habit. The first reminder is due at the
    /// next 18:00 for its frequency.
    pub async fn create_habit(&self, owner: &UserId, new: NewHabit) -> Result<Habit> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(HabitError::validation("name must not be empty"));
        }
        if !new.goal.is_finite() || new.goal <= 0.0 {
            return Err(HabitError::validation(format!(
                "goal must be a positive number, got {}",
                new.goal
            )));
        }
        let unit = match new.unit {
            Some(unit) if unit.trim().is_empty() => {
                return Err(HabitError::validation("unit must not be empty when given"));
            }
            Some(unit) => Some(unit.trim().to_string()),
            None => None,
        };
        let frequency: Frequency = new.frequency.parse()?;

        let now = self.clock.now();
        let habit = Habit::new(owner.clone(), name, new.goal, unit, frequency, now)
            .with_reminder(compute_next_reminder(frequency, now));

        self.store.insert(&habit).await?;

        info!(habit_id = %habit.id, owner_id = %owner, frequency = %frequency, "Habit created");
        self.store
            .audit(AuditEventType::HabitCreated {
                habit_id: habit.id,
                owner_id: owner.clone(),
            })
            .await;

        Ok(habit)
    }

    pub async fn list_habits(&self, owner: &UserId) -> Result<Vec<Habit>> {
        self.store.find(&HabitFilter::by_owner(owner.clone())).await
    }

    /// Add or remove progress.
    ///
    /// Decrements stop at zero, increments are not capped. Reaching the goal
    /// marks the habit completed in the same write; a later decrement does
    /// not undo that.
    pub async fn apply_delta(
        &self,
        habit_id: HabitId,
        owner: &UserId,
        delta: ProgressDelta,
    ) -> Result<Habit> {
        let magnitude = delta.magnitude();
        if !magnitude.is_finite() || magnitude <= 0.0 {
            return Err(HabitError::invalid_delta(format!(
                "amount must be a positive number, got {}",
                magnitude
            )));
        }

        for attempt in 1..=MAX_PROGRESS_ATTEMPTS {
            let Some(mut habit) = self.store.find_owned(habit_id, owner).await? else {
                return Err(HabitError::NotFound(habit_id));
            };

            let progress = delta.apply(habit.progress);
            let completed = habit.completed || progress >= habit.goal;

            // Any write since the read (a reset or another delta) fails the guard
            let guard = HabitGuard::none()
                .owner(owner.clone())
                .last_reset(habit.last_reset)
                .progress(habit.progress)
                .completed(habit.completed);
            let matched = self
                .store
                .update(&habit.id, &guard, &HabitPatch::progress(progress, completed))
                .await?;

            if matched > 0 {
                let newly_completed = completed && !habit.completed;
                habit.progress = progress;
                habit.completed = completed;
                debug!(
                    habit_id = %habit.id,
                    owner_id = %owner,
                    progress,
                    newly_completed,
                    "Progress updated"
                );
                return Ok(habit);
            }

            debug!(habit_id = %habit_id, attempt, "Habit changed during progress update, retrying");
        }

        Err(HabitError::internal(format!(
            "habit {} kept changing during progress update",
            habit_id
        )))
    }

    /// Move a habit to the owner's past habits, whether or not its goal was
    /// met, and count it as finished.
    pub async fn archive(&self, habit_id: HabitId, owner: &UserId) -> Result<PastHabit> {
        let Some(habit) = self.store.find_owned(habit_id, owner).await? else {
            return Err(HabitError::NotFound(habit_id));
        };

        let past = PastHabit::new(habit, self.clock.now());
        let outcome = self.store.archive(&past).await?;

        info!(
            habit_id = %habit_id,
            owner_id = %owner,
            goal_met = past.habit.goal_reached(),
            newly_archived = outcome.newly_archived,
            "Habit archived"
        );
        self.store
            .audit(AuditEventType::HabitArchived {
                habit_id,
                owner_id: owner.clone(),
                newly_archived: outcome.newly_archived,
            })
            .await;

        Ok(past)
    }

    pub async fn list_past_habits(&self, owner: &UserId) -> Result<Vec<PastHabit>> {
        self.store.past_habits(owner).await
    }

    pub async fn user_stats(&self, owner: &UserId) -> Result<UserStats> {
        self.store.user_stats(owner).await
    }

    /// Individual leaderboard by finished habits
    pub async fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
        let limit = limit.unwrap_or(self.leaderboard_limit);
        self.store.top_users(limit).await
    }

    /// Record a collected badge; collecting the same badge again is a no-op
    pub async fn collect_badge(&self, owner: &UserId, badge_id: &str) -> Result<UserStats> {
        let badge_id = badge_id.trim();
        if badge_id.is_empty() {
            return Err(HabitError::validation("badge id must not be empty"));
        }

        let added = self.store.add_badge(owner, badge_id).await?;
        debug!(owner_id = %owner, badge_id, added, "Badge collected");
        self.store.user_stats(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use habitlink_store::{HabitStore, MemoryStore, SqliteStore};
    use habitlink_util::FixedClock;
    use std::time::Duration;

    fn utc(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    fn engine_with(store: Arc<dyn HabitStore>) -> (HabitEngine, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(utc(1, 9)));
        let engine = HabitEngine::new(
            BoundedStore::new(store, Duration::from_secs(1)),
            clock.clone(),
            15,
        );
        (engine, clock)
    }

    fn new_habit(name: &str, goal: f64, frequency: &str) -> NewHabit {
        NewHabit {
            name: name.into(),
            goal,
            frequency: frequency.into(),
            unit: Some("miles".into()),
        }
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn create_sets_first_reminder() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let habit = engine
            .create_habit(&alice(), new_habit("  Run ", 5.0, "Daily"))
            .await
            .unwrap();

        assert_eq!(habit.name, "Run");
        assert_eq!(habit.frequency, Frequency::Daily);
        assert_eq!(habit.created_at, utc(1, 9));
        assert_eq!(habit.last_reset, utc(1, 9));
        assert_eq!(habit.reminder_time, Some(utc(1, 18)));
        assert_eq!(engine.list_habits(&alice()).await.unwrap(), vec![habit]);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));

        let err = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "fortnightly"))
            .await
            .unwrap_err();
        assert!(matches!(err, HabitError::InvalidFrequency(_)));

        for bad in [new_habit(" ", 5.0, "daily"), new_habit("Run", 0.0, "daily"), new_habit("Run", f64::NAN, "daily")] {
            let err = engine.create_habit(&alice(), bad).await.unwrap_err();
            assert!(matches!(err, HabitError::Validation(_)));
        }

        let mut empty_unit = new_habit("Run", 5.0, "daily");
        empty_unit.unit = Some(String::new());
        assert!(engine.create_habit(&alice(), empty_unit).await.is_err());

        assert!(engine.list_habits(&alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn increment_to_goal_completes() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let habit = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "daily"))
            .await
            .unwrap();

        let updated = engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Increment(3.0))
            .await
            .unwrap();
        assert_eq!(updated.progress, 3.0);
        assert!(!updated.completed);

        let updated = engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Increment(2.0))
            .await
            .unwrap();
        assert_eq!(updated.progress, 5.0);
        assert!(updated.completed);

        // Uncapped, and a decrement does not un-complete
        let updated = engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Increment(4.0))
            .await
            .unwrap();
        assert_eq!(updated.progress, 9.0);
        let updated = engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Decrement(8.0))
            .await
            .unwrap();
        assert_eq!(updated.progress, 1.0);
        assert!(updated.completed);
    }

    #[tokio::test]
    async fn decrement_floors_at_zero() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let habit = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "daily"))
            .await
            .unwrap();
        engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Increment(1.0))
            .await
            .unwrap();

        let updated = engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Decrement(2.0))
            .await
            .unwrap();
        assert_eq!(updated.progress, 0.0);
    }

    #[tokio::test]
    async fn concurrent_increments_both_count() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine_with(store.clone());
        let habit = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "daily"))
            .await
            .unwrap();

        // Both reads happen before either write
        store.set_delay(Some(Duration::from_millis(30)));
        let user = alice();
        let (first, second) = tokio::join!(
            engine.apply_delta(habit.id, &user, ProgressDelta::Increment(1.0)),
            engine.apply_delta(habit.id, &user, ProgressDelta::Increment(1.0)),
        );
        first.unwrap();
        second.unwrap();

        store.set_delay(None);
        let stored = engine.list_habits(&alice()).await.unwrap();
        assert_eq!(stored[0].progress, 2.0);
    }

    #[tokio::test]
    async fn progress_failed_on_locked_database_is_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("habitlink.db");
        let limit = Duration::from_millis(100);
        let store = Arc::new(
            SqliteStore::open(&path)
                .unwrap()
                .with_budget(BoundedStore::backend_budget(limit)),
        );
        let engine = HabitEngine::new(
            BoundedStore::new(store, limit),
            Arc::new(FixedClock::new(utc(1, 9))),
            15,
        );
        let habit = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "daily"))
            .await
            .unwrap();

        let locker = rusqlite::Connection::open(&path).unwrap();
        locker.execute_batch("BEGIN IMMEDIATE").unwrap();
        let holder = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(300));
            locker.execute_batch("COMMIT").unwrap();
        });

        let result = engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Increment(1.0))
            .await;
        assert!(result.is_err());
        holder.join().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored = engine.list_habits(&alice()).await.unwrap();
        assert_eq!(stored[0].progress, 0.0);
    }

    #[tokio::test]
    async fn invalid_delta_changes_nothing() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let habit = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "daily"))
            .await
            .unwrap();

        for delta in [
            ProgressDelta::Increment(0.0),
            ProgressDelta::Decrement(-1.0),
            ProgressDelta::Increment(f64::INFINITY),
        ] {
            let err = engine.apply_delta(habit.id, &alice(), delta).await.unwrap_err();
            assert!(matches!(err, HabitError::InvalidDelta(_)));
        }

        let stored = engine.list_habits(&alice()).await.unwrap();
        assert_eq!(stored[0].progress, 0.0);
    }

    #[tokio::test]
    async fn progress_on_someone_elses_habit_is_not_found() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let habit = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "daily"))
            .await
            .unwrap();

        let err = engine
            .apply_delta(habit.id, &UserId::new("mallory"), ProgressDelta::Increment(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, HabitError::NotFound(id) if id == habit.id));
    }

    #[tokio::test]
    async fn store_failure_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine_with(store.clone());
        let habit = engine
            .create_habit(&alice(), new_habit("Run", 5.0, "daily"))
            .await
            .unwrap();

        store.fail_update(true);
        let err = engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Increment(1.0))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn archive_moves_habit_and_counts_it() {
        let (engine, clock) = engine_with(Arc::new(MemoryStore::new()));
        let habit = engine
            .create_habit(&alice(), new_habit("Read", 30.0, "weekly"))
            .await
            .unwrap();
        engine
            .apply_delta(habit.id, &alice(), ProgressDelta::Increment(10.0))
            .await
            .unwrap();

        clock.set(utc(3, 12));
        let past = engine.archive(habit.id, &alice()).await.unwrap();
        assert_eq!(past.id(), habit.id);
        assert_eq!(past.archived_at, utc(3, 12));
        assert_eq!(past.habit.progress, 10.0);

        assert!(engine.list_habits(&alice()).await.unwrap().is_empty());
        assert_eq!(engine.list_past_habits(&alice()).await.unwrap(), vec![past]);
        assert_eq!(engine.user_stats(&alice()).await.unwrap().habits_finished, 1);

        // Already archived
        let err = engine.archive(habit.id, &alice()).await.unwrap_err();
        assert!(matches!(err, HabitError::NotFound(_)));
        assert_eq!(engine.user_stats(&alice()).await.unwrap().habits_finished, 1);
    }

    #[tokio::test]
    async fn archive_of_foreign_or_missing_habit_is_not_found() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let habit = engine
            .create_habit(&alice(), new_habit("Read", 30.0, "weekly"))
            .await
            .unwrap();
        let bob = UserId::new("bob");

        assert!(matches!(
            engine.archive(habit.id, &bob).await,
            Err(HabitError::NotFound(_))
        ));
        assert!(matches!(
            engine.archive(HabitId::new(), &alice()).await,
            Err(HabitError::NotFound(_))
        ));

        assert!(engine.list_past_habits(&bob).await.unwrap().is_empty());
        assert!(engine.list_past_habits(&alice()).await.unwrap().is_empty());
        assert_eq!(engine.user_stats(&bob).await.unwrap().habits_finished, 0);
        assert_eq!(engine.user_stats(&alice()).await.unwrap().habits_finished, 0);
        assert_eq!(engine.list_habits(&alice()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leaderboard_uses_default_limit() {
        let (engine, _) = engine_with(Arc::new(SqliteStore::in_memory().unwrap()));
        for i in 0..20 {
            let owner = UserId::new(format!("user-{i:02}"));
            let habit = engine
                .create_habit(&owner, new_habit("Walk", 1.0, "daily"))
                .await
                .unwrap();
            engine.archive(habit.id, &owner).await.unwrap();
        }

        assert_eq!(engine.leaderboard(None).await.unwrap().len(), 15);
        assert_eq!(engine.leaderboard(Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn badges_are_collected_once() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));

        engine.collect_badge(&alice(), "early-bird").await.unwrap();
        let stats = engine.collect_badge(&alice(), "early-bird").await.unwrap();
        assert_eq!(stats.badges_collected.len(), 1);

        assert!(matches!(
            engine.collect_badge(&alice(), "  ").await,
            Err(HabitError::Validation(_))
        ));
    }
}
