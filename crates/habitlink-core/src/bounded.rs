//! Store access with a per-call deadline

use habitlink_api::{Habit, LeaderboardEntry, PastHabit, UserStats};
use habitlink_store::{
    ArchiveOutcome, AuditEvent, AuditEventType, HabitFilter, HabitGuard, HabitPatch, HabitStore,
    StoreResult,
};
use habitlink_util::{HabitError, HabitId, Result, UserId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Shared store handle that fails a call with `StoreTimeout` once it runs
/// longer than the configured limit.
#[derive(Clone)]
pub struct BoundedStore {
    store: Arc<dyn HabitStore>,
    limit: Duration,
}

impl BoundedStore {
    pub fn new(store: Arc<dyn HabitStore>, limit: Duration) -> Self {
        Self { store, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Share of `limit` a backend may spend on one call, lock waits
    /// included, so it gives up before the deadline here fires
    pub fn backend_budget(limit: Duration) -> Duration {
        limit * 4 / 5
    }

    pub fn inner(&self) -> &Arc<dyn HabitStore> {
        &self.store
    }

    async fn call<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(result) => result.map_err(HabitError::from),
            Err(_) => Err(HabitError::StoreTimeout(self.limit)),
        }
    }

    pub async fn find(&self, filter: &HabitFilter) -> Result<Vec<Habit>> {
        self.call(self.store.find_habits(filter)).await
    }

    /// The habit with `id` if it exists and belongs to `owner`
    pub async fn find_owned(&self, id: HabitId, owner: &UserId) -> Result<Option<Habit>> {
        let filter = HabitFilter::by_id(id).owned_by(owner.clone());
        Ok(self.find(&filter).await?.into_iter().next())
    }

    pub async fn insert(&self, habit: &Habit) -> Result<HabitId> {
        self.call(self.store.insert_habit(habit)).await
    }

    pub async fn update(&self, id: &HabitId, guard: &HabitGuard, patch: &HabitPatch) -> Result<u64> {
        self.call(self.store.update_habit(id, guard, patch)).await
    }

    pub async fn delete(&self, id: &HabitId) -> Result<u64> {
        self.call(self.store.delete_habit(id)).await
    }

    /// Atomically swap `old_id` for `fresh` while `guard` holds
    pub async fn replace(&self, old_id: &HabitId, guard: &HabitGuard, fresh: &Habit) -> Result<bool> {
        self.call(self.store.replace_habit(old_id, guard, fresh)).await
    }

    pub async fn archive(&self, past: &PastHabit) -> Result<ArchiveOutcome> {
        self.call(self.store.archive_habit(past)).await
    }

    pub async fn past_habits(&self, owner: &UserId) -> Result<Vec<PastHabit>> {
        self.call(self.store.list_past_habits(owner)).await
    }

    pub async fn user_stats(&self, user: &UserId) -> Result<UserStats> {
        self.call(self.store.user_stats(user)).await
    }

    pub async fn top_users(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        self.call(self.store.top_users(limit)).await
    }

    pub async fn add_badge(&self, user: &UserId, badge_id: &str) -> Result<bool> {
        self.call(self.store.add_badge(user, badge_id)).await
    }

    pub async fn recent_audits(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.call(self.store.recent_audits(limit)).await
    }

    pub async fn is_healthy(&self) -> bool {
        tokio::time::timeout(self.limit, self.store.is_healthy())
            .await
            .unwrap_or(false)
    }

    /// Best-effort audit write; failures are logged, never returned
    pub async fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.call(self.store.append_audit(AuditEvent::new(event))).await {
            warn!(error = %e, "Failed to write audit event");
        }
    }
}
