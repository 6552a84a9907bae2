//! Event types for habitlinkd -> client streaming

use chrono::{DateTime, Utc};
use habitlink_util::{HabitId, UserId};
use serde::{Deserialize, Serialize};

use crate::API_VERSION;

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: habitlink_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients.
///
/// Subscribers are the delivery side: they turn `ReminderDue` into push
/// or email notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A reminder became due and its due-time was advanced
    ReminderDue {
        habit_id: HabitId,
        user_id: UserId,
        message: String,
        next_reminder: DateTime<Utc>,
    },

    /// Progress was zeroed for a new tracking period
    HabitReset { habit_id: HabitId, user_id: UserId },

    /// A completed habit was replaced for a new tracking period
    HabitRecreated {
        old_id: HabitId,
        new_id: HabitId,
        user_id: UserId,
    },

    /// A habit was finished and archived
    HabitArchived { habit_id: HabitId, user_id: UserId },
}
