//! Reminder scanner

use chrono::{DateTime, Utc};
use habitlink_api::{DueReminder, Habit};
use habitlink_config::ReschedulePolicy;
use habitlink_store::{AuditEventType, HabitFilter, HabitGuard, HabitPatch};
use habitlink_util::{Result, UserId};
use tracing::{debug, info, warn};

use crate::{reminder_message, reschedule, BoundedStore};

/// Finds habits whose reminder is due and advances their due-time.
///
/// A reminder is surfaced only when this scan is the one that moved the
/// due-time forward, so overlapping scans never surface it twice.
pub struct ReminderScanner {
    store: BoundedStore,
    policy: ReschedulePolicy,
}

impl ReminderScanner {
    pub fn new(store: BoundedStore, policy: ReschedulePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ReschedulePolicy {
        self.policy
    }

    /// Reminders due at `now`, for one user or for everyone.
    ///
    /// Store failures are logged; whatever was surfaced before the failure
    /// is still returned.
    pub async fn due_reminders(&self, now: DateTime<Utc>, scope: Option<&UserId>) -> Vec<DueReminder> {
        let mut filter = HabitFilter::reminders_due(now);
        if let Some(owner) = scope {
            filter = filter.owned_by(owner.clone());
        }

        let habits = match self.store.find(&filter).await {
            Ok(habits) => habits,
            Err(e) => {
                warn!(error = %e, "Reminder scan could not list habits");
                return Vec::new();
            }
        };

        let mut reminders = Vec::new();
        let (mut cleared, mut failed) = (0usize, 0usize);

        for habit in &habits {
            let result = if habit.completed {
                self.clear(habit).await.map(|done| {
                    cleared += usize::from(done);
                })
            } else {
                self.advance(habit, now).await.map(|due| reminders.extend(due))
            };

            if let Err(e) = result {
                failed += 1;
                warn!(habit_id = %habit.id, error = %e, "Reminder update failed");
            }
        }

        info!(
            due = habits.len(),
            surfaced = reminders.len(),
            cleared,
            failed,
            scoped = scope.is_some(),
            "Reminder scan complete"
        );
        if !reminders.is_empty() {
            self.store
                .audit(AuditEventType::RemindersSent {
                    count: reminders.len(),
                })
                .await;
        }

        reminders
    }

    async fn advance(&self, habit: &Habit, now: DateTime<Utc>) -> Result<Option<DueReminder>> {
        let next = reschedule(self.policy, habit.frequency, now);
        let guard = HabitGuard::none().reminder_time(habit.reminder_time);
        let matched = self
            .store
            .update(&habit.id, &guard, &HabitPatch::reminder(Some(next)))
            .await?;

        if matched == 0 {
            debug!(habit_id = %habit.id, "Reminder already taken by another scan");
            return Ok(None);
        }

        debug!(habit_id = %habit.id, owner_id = %habit.owner_id, next = %next, "Reminder due");
        Ok(Some(DueReminder {
            habit_id: habit.id,
            owner_id: habit.owner_id.clone(),
            message: reminder_message(habit),
            next_reminder: next,
        }))
    }

    async fn clear(&self, habit: &Habit) -> Result<bool> {
        let guard = HabitGuard::none().reminder_time(habit.reminder_time);
        let matched = self
            .store
            .update(&habit.id, &guard, &HabitPatch::reminder(None))
            .await?;

        debug!(habit_id = %habit.id, cleared = matched > 0, "Reminder cleared for completed habit");
        Ok(matched > 0)
    }
}
