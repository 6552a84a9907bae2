//! Recurrence engine: rolls habits over into their next tracking period

use chrono::{DateTime, Utc};
use habitlink_api::{Habit, RecurrenceAction, RecurrenceOutcome};
use habitlink_store::{AuditEventType, HabitFilter, HabitGuard, HabitPatch};
use habitlink_util::Result;
use tracing::{debug, error, info, warn};

use crate::{compute_next_reminder, BoundedStore};

/// What happened to one habit during a tick
#[derive(Debug)]
enum Decision {
    Untouched,
    /// Another writer got there first
    Skipped,
    Done(RecurrenceAction),
}

/// Scans all live habits and starts a new period for every habit whose
/// current period has ended.
///
/// Incomplete habits are reset in place. Completed habits are replaced by a
/// fresh copy with a new id so the finished one can be told apart.
pub struct RecurrenceEngine {
    store: BoundedStore,
}

impl RecurrenceEngine {
    pub fn new(store: BoundedStore) -> Self {
        Self { store }
    }

    /// Run one pass at `now`. Per-habit failures are logged and the pass
    /// continues; only the actions that took effect are returned.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<RecurrenceOutcome> {
        let habits = match self.store.find(&HabitFilter::all()).await {
            Ok(habits) => habits,
            Err(e) => {
                warn!(error = %e, "Recurrence scan could not list habits");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        let (mut skipped, mut failed) = (0usize, 0usize);

        for habit in &habits {
            match self.roll_over(habit, now).await {
                Ok(Decision::Done(action)) => outcomes.push(RecurrenceOutcome {
                    habit_id: habit.id,
                    owner_id: habit.owner_id.clone(),
                    action,
                }),
                Ok(Decision::Skipped) => skipped += 1,
                Ok(Decision::Untouched) => {}
                Err(e) => {
                    failed += 1;
                    warn!(habit_id = %habit.id, error = %e, "Recurrence failed for habit");
                }
            }
        }

        let reset = outcomes
            .iter()
            .filter(|o| o.action == RecurrenceAction::Reset)
            .count();
        let recreated = outcomes.len() - reset;

        info!(
            scanned = habits.len(),
            reset, recreated, skipped, failed, "Recurrence tick complete"
        );
        if !outcomes.is_empty() || failed > 0 {
            self.store
                .audit(AuditEventType::RecurrenceRan {
                    reset,
                    recreated,
                    failed,
                })
                .await;
        }

        outcomes
    }

    async fn roll_over(&self, habit: &Habit, now: DateTime<Utc>) -> Result<Decision> {
        let Some(period_end) = habit.next_occurrence() else {
            debug!(habit_id = %habit.id, "Period end out of range, never due");
            return Ok(Decision::Untouched);
        };
        if period_end > now {
            return Ok(Decision::Untouched);
        }

        if habit.completed {
            self.recreate(habit, now).await
        } else {
            self.reset(habit, now).await
        }
    }

    async fn reset(&self, habit: &Habit, now: DateTime<Utc>) -> Result<Decision> {
        let guard = HabitGuard::none()
            .last_reset(habit.last_reset)
            .progress(habit.progress)
            .completed(false);
        let matched = self
            .store
            .update(&habit.id, &guard, &HabitPatch::reset(now))
            .await?;

        if matched == 0 {
            debug!(habit_id = %habit.id, "Habit changed since read, reset skipped");
            return Ok(Decision::Skipped);
        }

        debug!(habit_id = %habit.id, owner_id = %habit.owner_id, "Habit reset");
        self.store
            .audit(AuditEventType::HabitReset {
                habit_id: habit.id,
                owner_id: habit.owner_id.clone(),
            })
            .await;
        Ok(Decision::Done(RecurrenceAction::Reset))
    }

    /// Swap the completed habit for a fresh copy in one store call, guarded
    /// on the values read. When another instance got there first nothing is
    /// written.
    async fn recreate(&self, habit: &Habit, now: DateTime<Utc>) -> Result<Decision> {
        let fresh = Habit::new(
            habit.owner_id.clone(),
            habit.name.clone(),
            habit.goal,
            habit.unit.clone(),
            habit.frequency,
            now,
        )
        .with_reminder(compute_next_reminder(habit.frequency, now));

        let guard = HabitGuard::none()
            .last_reset(habit.last_reset)
            .completed(true);

        match self.store.replace(&habit.id, &guard, &fresh).await {
            Ok(false) => {
                debug!(habit_id = %habit.id, "Habit changed or recreated elsewhere");
                Ok(Decision::Skipped)
            }
            Ok(true) => {
                debug!(
                    old_id = %habit.id,
                    new_id = %fresh.id,
                    owner_id = %habit.owner_id,
                    "Habit recreated"
                );
                self.store
                    .audit(AuditEventType::HabitRecreated {
                        old_id: habit.id,
                        new_id: fresh.id,
                        owner_id: habit.owner_id.clone(),
                    })
                    .await;
                Ok(Decision::Done(RecurrenceAction::Recreated { new_id: fresh.id }))
            }
            Err(e) => {
                error!(
                    old_id = %habit.id,
                    new_id = %fresh.id,
                    owner_id = %habit.owner_id,
                    error = %e,
                    "Recreation incomplete, either the original or the replacement is live"
                );
                self.store
                    .audit(AuditEventType::RecreationIncomplete {
                        old_id: habit.id,
                        new_id: fresh.id,
                        owner_id: habit.owner_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use habitlink_api::{Frequency, LeaderboardEntry, PastHabit, UserStats};
    use habitlink_store::{
        ArchiveOutcome, AuditEvent, HabitStore, MemoryStore, SqliteStore, StoreResult, UserCounter,
    };
    use habitlink_util::{HabitId, UserId};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn utc(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    fn daily(last_reset: DateTime<Utc>) -> Habit {
        Habit::new(
            UserId::new("u1"),
            "Stretch",
            10.0,
            Some("minutes".into()),
            Frequency::Daily,
            last_reset,
        )
        .with_reminder(compute_next_reminder(Frequency::Daily, last_reset))
    }

    fn engine(store: Arc<dyn HabitStore>) -> RecurrenceEngine {
        RecurrenceEngine::new(BoundedStore::new(store, Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn daily_reset_happens_exactly_at_period_end() {
        let store = Arc::new(MemoryStore::new());
        let mut habit = daily(utc(1, 8));
        habit.progress = 4.0;
        store.insert_habit(&habit).await.unwrap();
        let recurrence = engine(store.clone());

        assert!(recurrence.tick(utc(2, 7)).await.is_empty());

        let outcomes = recurrence.tick(utc(2, 8)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, RecurrenceAction::Reset);

        let stored = store.find_habits(&HabitFilter::by_id(habit.id)).await.unwrap();
        assert_eq!(stored[0].progress, 0.0);
        assert_eq!(stored[0].last_reset, utc(2, 8));
        assert_eq!(stored[0].created_at, habit.created_at);
    }

    #[tokio::test]
    async fn weekly_habit_is_reset_after_seven_days() {
        let store = Arc::new(MemoryStore::new());
        let mut habit = daily(utc(1, 8));
        habit.frequency = Frequency::Weekly;
        store.insert_habit(&habit).await.unwrap();
        let recurrence = engine(store.clone());

        assert!(recurrence.tick(utc(7, 8)).await.is_empty());
        assert_eq!(recurrence.tick(utc(8, 8)).await.len(), 1);
    }

    #[tokio::test]
    async fn completed_habit_is_recreated() {
        let store = Arc::new(MemoryStore::new());
        let mut habit = daily(utc(1, 8));
        habit.progress = 10.0;
        habit.completed = true;
        store.insert_habit(&habit).await.unwrap();

        let now = utc(2, 9);
        let outcomes = engine(store.clone()).tick(now).await;

        let RecurrenceAction::Recreated { new_id } = outcomes[0].action else {
            panic!("expected recreation, got {:?}", outcomes[0].action);
        };
        assert_ne!(new_id, habit.id);

        let live = store.find_habits(&HabitFilter::all()).await.unwrap();
        assert_eq!(live.len(), 1);
        let fresh = &live[0];
        assert_eq!(fresh.id, new_id);
        assert_eq!(fresh.name, habit.name);
        assert_eq!(fresh.goal, habit.goal);
        assert_eq!(fresh.unit, habit.unit);
        assert_eq!(fresh.frequency, habit.frequency);
        assert_eq!(fresh.owner_id, habit.owner_id);
        assert_eq!(fresh.progress, 0.0);
        assert!(!fresh.completed);
        assert_eq!(fresh.created_at, now);
        assert_eq!(fresh.last_reset, now);
        assert_eq!(fresh.reminder_time, Some(utc(2, 18)));
    }

    #[tokio::test]
    async fn monthly_period_clamps_to_month_end() {
        let store = Arc::new(MemoryStore::new());
        let jan31 = Utc.with_ymd_and_hms(2023, 1, 31, 12, 0, 0).unwrap();
        let mut habit = daily(jan31);
        habit.frequency = Frequency::Monthly;
        store.insert_habit(&habit).await.unwrap();
        let recurrence = engine(store.clone());

        let feb27 = Utc.with_ymd_and_hms(2023, 2, 27, 12, 0, 0).unwrap();
        assert!(recurrence.tick(feb27).await.is_empty());

        let feb28 = Utc.with_ymd_and_hms(2023, 2, 28, 12, 0, 0).unwrap();
        assert_eq!(recurrence.tick(feb28).await.len(), 1);
    }

    #[tokio::test]
    async fn reset_guard_rejects_stale_read() {
        let store = Arc::new(MemoryStore::new());
        let habit = daily(utc(1, 8));
        store.insert_habit(&habit).await.unwrap();

        // Another instance already reset it
        let patch = HabitPatch::reset(utc(2, 8));
        store
            .update_habit(&habit.id, &HabitGuard::none(), &patch)
            .await
            .unwrap();

        let recurrence = engine(store.clone());
        let decision = recurrence.reset(&habit, utc(2, 9)).await.unwrap();
        assert!(matches!(decision, Decision::Skipped));

        let stored = store.find_habits(&HabitFilter::by_id(habit.id)).await.unwrap();
        assert_eq!(stored[0].last_reset, utc(2, 8));
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_scan() {
        let store = Arc::new(MemoryStore::new());
        let mut done = daily(utc(1, 8));
        done.completed = true;
        let open = daily(utc(1, 9));
        store.insert_habit(&done).await.unwrap();
        store.insert_habit(&open).await.unwrap();

        // Recreating `done` needs an insert
        store.fail_insert(true);

        let outcomes = engine(store.clone()).tick(utc(3, 0)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].habit_id, open.id);
        assert_eq!(outcomes[0].action, RecurrenceAction::Reset);
        assert_eq!(store.habit_count(), 2);
    }

    #[tokio::test]
    async fn failed_replacement_keeps_the_original() {
        let store = Arc::new(MemoryStore::new());
        let mut habit = daily(utc(1, 8));
        habit.completed = true;
        store.insert_habit(&habit).await.unwrap();
        store.fail_delete(true);

        let outcomes = engine(store.clone()).tick(utc(2, 9)).await;
        assert!(outcomes.is_empty());
        let live = store.find_habits(&HabitFilter::all()).await.unwrap();
        assert_eq!(live, vec![habit.clone()]);

        let audits = store.recent_audits(10).await.unwrap();
        assert!(audits.iter().any(|a| matches!(
            &a.event,
            AuditEventType::RecreationIncomplete { old_id, .. } if *old_id == habit.id
        )));

        store.fail_delete(false);
        assert_eq!(engine(store.clone()).tick(utc(2, 9)).await.len(), 1);
        assert_eq!(store.habit_count(), 1);
    }

    #[tokio::test]
    async fn reset_skips_habit_completed_since_read() {
        let store = Arc::new(MemoryStore::new());
        let mut habit = daily(utc(1, 8));
        habit.progress = 4.0;
        store.insert_habit(&habit).await.unwrap();

        // Progress logged between the scan's read and its write
        let patch = HabitPatch::progress(10.0, true);
        store
            .update_habit(&habit.id, &HabitGuard::none(), &patch)
            .await
            .unwrap();

        let recurrence = engine(store.clone());
        let decision = recurrence.reset(&habit, utc(2, 9)).await.unwrap();
        assert!(matches!(decision, Decision::Skipped));

        let stored = store.find_habits(&HabitFilter::by_id(habit.id)).await.unwrap();
        assert_eq!(stored[0].progress, 10.0);
        assert!(stored[0].completed);
        assert_eq!(stored[0].last_reset, utc(1, 8));

        // The next pass sees it completed and recreates it
        let outcomes = recurrence.tick(utc(2, 9)).await;
        assert!(matches!(outcomes[0].action, RecurrenceAction::Recreated { .. }));
    }

    #[tokio::test]
    async fn slow_habit_does_not_hold_up_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let first = daily(utc(1, 8));
        let mut slow = daily(utc(1, 8));
        slow.progress = 2.0;
        let mut done = daily(utc(1, 8));
        done.completed = true;
        for h in [&first, &slow, &done] {
            store.insert_habit(h).await.unwrap();
        }
        store.slow_writes_to(slow.id, Duration::from_millis(500));

        let recurrence = RecurrenceEngine::new(BoundedStore::new(
            store.clone(),
            Duration::from_millis(50),
        ));
        let outcomes = recurrence.tick(utc(2, 9)).await;

        let handled: Vec<HabitId> = outcomes.iter().map(|o| o.habit_id).collect();
        assert_eq!(handled.len(), 2);
        assert!(handled.contains(&first.id));
        assert!(handled.contains(&done.id));

        let stored = store.find_habits(&HabitFilter::by_id(slow.id)).await.unwrap();
        assert_eq!(stored[0].progress, 2.0);
        assert_eq!(stored[0].last_reset, utc(1, 8));

        let audits = store.recent_audits(10).await.unwrap();
        assert!(audits.iter().any(|a| matches!(
            a.event,
            AuditEventType::RecurrenceRan { reset: 1, recreated: 1, failed: 1 }
        )));
    }

    /// Store where a concurrent instance recreates the habit just before
    /// this instance does.
    struct RacingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl HabitStore for RacingStore {
        async fn find_habits(&self, filter: &HabitFilter) -> StoreResult<Vec<Habit>> {
            self.inner.find_habits(filter).await
        }
        async fn insert_habit(&self, habit: &Habit) -> StoreResult<HabitId> {
            self.inner.insert_habit(habit).await
        }
        async fn update_habit(
            &self,
            id: &HabitId,
            guard: &HabitGuard,
            patch: &HabitPatch,
        ) -> StoreResult<u64> {
            self.inner.update_habit(id, guard, patch).await
        }
        async fn delete_habit(&self, id: &HabitId) -> StoreResult<u64> {
            self.inner.delete_habit(id).await
        }
        async fn replace_habit(
            &self,
            old_id: &HabitId,
            guard: &HabitGuard,
            fresh: &Habit,
        ) -> StoreResult<bool> {
            let mut theirs = fresh.clone();
            theirs.id = HabitId::new();
            self.inner.replace_habit(old_id, guard, &theirs).await?;
            self.inner.replace_habit(old_id, guard, fresh).await
        }
        async fn insert_past_habit(&self, past: &PastHabit) -> StoreResult<HabitId> {
            self.inner.insert_past_habit(past).await
        }
        async fn archive_habit(&self, past: &PastHabit) -> StoreResult<ArchiveOutcome> {
            self.inner.archive_habit(past).await
        }
        async fn list_past_habits(&self, owner: &UserId) -> StoreResult<Vec<PastHabit>> {
            self.inner.list_past_habits(owner).await
        }
        async fn increment_user_counter(
            &self,
            user: &UserId,
            counter: UserCounter,
            by: i64,
        ) -> StoreResult<()> {
            self.inner.increment_user_counter(user, counter, by).await
        }
        async fn user_stats(&self, user: &UserId) -> StoreResult<UserStats> {
            self.inner.user_stats(user).await
        }
        async fn top_users(&self, limit: usize) -> StoreResult<Vec<LeaderboardEntry>> {
            self.inner.top_users(limit).await
        }
        async fn add_badge(&self, user: &UserId, badge_id: &str) -> StoreResult<bool> {
            self.inner.add_badge(user, badge_id).await
        }
        async fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
            self.inner.append_audit(event).await
        }
        async fn recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
            self.inner.recent_audits(limit).await
        }
        async fn is_healthy(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn lost_recreation_race_leaves_one_copy() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
        });
        let mut habit = daily(utc(1, 8));
        habit.completed = true;
        store.insert_habit(&habit).await.unwrap();

        let outcomes = engine(store.clone()).tick(utc(2, 9)).await;
        assert!(outcomes.is_empty());

        let live = store.find_habits(&HabitFilter::all()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_ne!(live[0].id, habit.id);
        assert!(!live[0].completed);
    }

    /// Take the database write lock from a second connection and release it
    /// after `hold`. Reads still go through while it is held.
    fn hold_write_lock(path: &Path, hold: Duration) -> std::thread::JoinHandle<()> {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(hold);
            conn.execute_batch("COMMIT").unwrap();
        })
    }

    #[tokio::test]
    async fn locked_database_fails_recreation_without_losing_the_habit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("habitlink.db");
        let limit = Duration::from_millis(100);
        let store = Arc::new(
            SqliteStore::open(&path)
                .unwrap()
                .with_budget(BoundedStore::backend_budget(limit)),
        );
        let mut habit = daily(utc(1, 8));
        habit.completed = true;
        store.insert_habit(&habit).await.unwrap();
        let recurrence = RecurrenceEngine::new(BoundedStore::new(store.clone(), limit));

        let holder = hold_write_lock(&path, Duration::from_millis(300));
        assert!(recurrence.tick(utc(2, 9)).await.is_empty());
        holder.join().unwrap();

        let live = store.find_habits(&HabitFilter::all()).await.unwrap();
        assert_eq!(live, vec![habit.clone()]);

        let outcomes = recurrence.tick(utc(2, 9)).await;
        assert_eq!(outcomes.len(), 1);
        let live = store.find_habits(&HabitFilter::all()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(!live[0].completed);
    }

    #[tokio::test]
    async fn recreation_committing_after_the_deadline_leaves_one_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("habitlink.db");
        // Backend allowed to outlive the caller's deadline
        let store = Arc::new(
            SqliteStore::open(&path)
                .unwrap()
                .with_budget(Duration::from_millis(1000)),
        );
        let mut habit = daily(utc(1, 8));
        habit.completed = true;
        store.insert_habit(&habit).await.unwrap();
        let recurrence = RecurrenceEngine::new(BoundedStore::new(
            store.clone(),
            Duration::from_millis(100),
        ));

        let holder = hold_write_lock(&path, Duration::from_millis(300));
        assert!(recurrence.tick(utc(2, 9)).await.is_empty());
        holder.join().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let live = store.find_habits(&HabitFilter::all()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_ne!(live[0].id, habit.id);
        assert!(!live[0].completed);
        assert!(recurrence.tick(utc(2, 9)).await.is_empty());
    }

    #[tokio::test]
    async fn recurrence_against_sqlite() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut stale = daily(utc(1, 8));
        stale.progress = 3.0;
        let mut done = daily(utc(1, 8));
        done.completed = true;
        let fresh = daily(utc(2, 8));
        for h in [&stale, &done, &fresh] {
            store.insert_habit(h).await.unwrap();
        }

        let outcomes = engine(store.clone()).tick(utc(2, 8)).await;
        assert_eq!(outcomes.len(), 2);

        let live = store.find_habits(&HabitFilter::all()).await.unwrap();
        assert_eq!(live.len(), 3);
        assert!(live.iter().all(|h| h.progress == 0.0 && !h.completed));
        assert!(live.iter().all(|h| h.id != done.id));
    }
}
