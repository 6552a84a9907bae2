//! In-memory store with failure injection, used by tests

use async_trait::async_trait;
use habitlink_api::{Habit, LeaderboardEntry, PastHabit, UserStats};
use habitlink_util::{HabitId, UserId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::{
    ArchiveOutcome, AuditEvent, HabitFilter, HabitGuard, HabitPatch, HabitStore, StoreError,
    StoreResult, UserCounter,
};

#[derive(Default)]
struct MemoryState {
    habits: BTreeMap<HabitId, Habit>,
    past: BTreeMap<HabitId, PastHabit>,
    users: BTreeMap<UserId, UserStats>,
    audits: Vec<AuditEvent>,
}

impl MemoryState {
    fn user(&mut self, user: &UserId) -> &mut UserStats {
        self.users
            .entry(user.clone())
            .or_insert_with(|| UserStats::empty(user.clone()))
    }

    fn bump(&mut self, user: &UserId, counter: UserCounter, by: i64) {
        let stats = self.user(user);
        match counter {
            UserCounter::HabitsFinished => {
                stats.habits_finished = (stats.habits_finished as i64 + by).max(0) as u64;
            }
        }
    }
}

/// `HabitStore` backed by maps.
///
/// The `fail_*` switches make the matching calls return an error.
/// `set_delay` makes every call sleep first and `slow_writes_to` only the
/// writes to one habit (for timeout tests).
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_insert: AtomicBool,
    fail_update: AtomicBool,
    fail_delete: AtomicBool,
    delay: Mutex<Option<Duration>>,
    slow_writes: Mutex<BTreeMap<HabitId, Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn slow_writes_to(&self, id: HabitId, delay: Duration) {
        self.slow_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, delay);
    }

    /// Number of live habits
    pub fn habit_count(&self) -> usize {
        self.state().habits.len()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn pause_write(&self, id: &HabitId) {
        self.pause().await;
        let delay = self
            .slow_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(flag: &AtomicBool, what: &'static str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Injected(what))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HabitStore for MemoryStore {
    async fn find_habits(&self, filter: &HabitFilter) -> StoreResult<Vec<Habit>> {
        self.pause().await;
        let mut found: Vec<Habit> = self
            .state()
            .habits
            .values()
            .filter(|h| filter.matches(h))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn insert_habit(&self, habit: &Habit) -> StoreResult<HabitId> {
        self.pause().await;
        Self::check(&self.fail_insert, "insert")?;

        let mut state = self.state();
        if state.habits.contains_key(&habit.id) {
            return Err(StoreError::Database(format!("duplicate habit id {}", habit.id)));
        }
        state.habits.insert(habit.id, habit.clone());
        Ok(habit.id)
    }

    async fn update_habit(
        &self,
        id: &HabitId,
        guard: &HabitGuard,
        patch: &HabitPatch,
    ) -> StoreResult<u64> {
        self.pause_write(id).await;
        Self::check(&self.fail_update, "update")?;
        if patch.is_empty() {
            return Ok(0);
        }

        let mut state = self.state();
        match state.habits.get_mut(id) {
            Some(habit) if guard.holds(habit) => {
                patch.apply_to(habit);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_habit(&self, id: &HabitId) -> StoreResult<u64> {
        self.pause_write(id).await;
        Self::check(&self.fail_delete, "delete")?;
        Ok(self.state().habits.remove(id).map_or(0, |_| 1))
    }

    async fn replace_habit(
        &self,
        old_id: &HabitId,
        guard: &HabitGuard,
        fresh: &Habit,
    ) -> StoreResult<bool> {
        self.pause_write(old_id).await;
        Self::check(&self.fail_insert, "insert")?;
        Self::check(&self.fail_delete, "delete")?;

        let mut state = self.state();
        if !state.habits.get(old_id).is_some_and(|h| guard.holds(h)) {
            return Ok(false);
        }
        if state.habits.contains_key(&fresh.id) {
            return Err(StoreError::Database(format!("duplicate habit id {}", fresh.id)));
        }
        state.habits.remove(old_id);
        state.habits.insert(fresh.id, fresh.clone());
        Ok(true)
    }

    async fn insert_past_habit(&self, past: &PastHabit) -> StoreResult<HabitId> {
        self.pause().await;
        Self::check(&self.fail_insert, "insert")?;
        self.state()
            .past
            .entry(past.id())
            .or_insert_with(|| past.clone());
        Ok(past.id())
    }

    async fn archive_habit(&self, past: &PastHabit) -> StoreResult<ArchiveOutcome> {
        self.pause().await;
        Self::check(&self.fail_insert, "insert")?;
        Self::check(&self.fail_delete, "delete")?;

        let mut state = self.state();
        let newly_archived = !state.past.contains_key(&past.id());
        if newly_archived {
            state.past.insert(past.id(), past.clone());
            state.bump(&past.habit.owner_id, UserCounter::HabitsFinished, 1);
        }
        let removed = state.habits.remove(&past.id()).map_or(0, |_| 1);

        Ok(ArchiveOutcome {
            newly_archived,
            removed,
        })
    }

    async fn list_past_habits(&self, owner: &UserId) -> StoreResult<Vec<PastHabit>> {
        self.pause().await;
        let mut past: Vec<PastHabit> = self
            .state()
            .past
            .values()
            .filter(|p| p.habit.owner_id == *owner)
            .cloned()
            .collect();
        past.sort_by(|a, b| b.archived_at.cmp(&a.archived_at).then(a.id().cmp(&b.id())));
        Ok(past)
    }

    async fn increment_user_counter(
        &self,
        user: &UserId,
        counter: UserCounter,
        by: i64,
    ) -> StoreResult<()> {
        self.pause().await;
        Self::check(&self.fail_update, "update")?;
        self.state().bump(user, counter, by);
        Ok(())
    }

    async fn user_stats(&self, user: &UserId) -> StoreResult<UserStats> {
        self.pause().await;
        Ok(self
            .state()
            .users
            .get(user)
            .cloned()
            .unwrap_or_else(|| UserStats::empty(user.clone())))
    }

    async fn top_users(&self, limit: usize) -> StoreResult<Vec<LeaderboardEntry>> {
        self.pause().await;
        let mut entries: Vec<LeaderboardEntry> = self
            .state()
            .users
            .values()
            .filter(|u| u.habits_finished > 0)
            .map(|u| LeaderboardEntry {
                user_id: u.user_id.clone(),
                habits_finished: u.habits_finished,
            })
            .collect();
        entries.sort_by(|a, b| {
            b.habits_finished
                .cmp(&a.habits_finished)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn add_badge(&self, user: &UserId, badge_id: &str) -> StoreResult<bool> {
        self.pause().await;
        Self::check(&self.fail_update, "update")?;
        Ok(self
            .state()
            .user(user)
            .badges_collected
            .insert(badge_id.to_string()))
    }

    async fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let mut state = self.state();
        event.id = state.audits.len() as i64 + 1;
        state.audits.push(event);
        Ok(())
    }

    async fn recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        Ok(self
            .state()
            .audits
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn is_healthy(&self) -> bool {
        !self.fail_update.load(Ordering::SeqCst)
    }
}
