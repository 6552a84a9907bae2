//! Audit event types

use chrono::{DateTime, Utc};
use habitlink_util::{HabitId, UserId};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Configuration loaded at startup
    ConfigLoaded { reschedule: String },

    /// Habit created by its owner
    HabitCreated {
        habit_id: HabitId,
        owner_id: UserId,
    },

    /// Progress zeroed at the end of a period
    HabitReset {
        habit_id: HabitId,
        owner_id: UserId,
    },

    /// Completed habit replaced by a fresh one
    HabitRecreated {
        old_id: HabitId,
        new_id: HabitId,
        owner_id: UserId,
    },

    /// Replacing a completed habit failed or timed out. The swap is atomic,
    /// so either the original or the replacement is live; the next tick
    /// retries when it is the original.
    RecreationIncomplete {
        old_id: HabitId,
        new_id: HabitId,
        owner_id: UserId,
        error: String,
    },

    /// Habit moved to the past habits collection
    HabitArchived {
        habit_id: HabitId,
        owner_id: UserId,
        newly_archived: bool,
    },

    /// Summary of one recurrence tick
    RecurrenceRan {
        reset: usize,
        recreated: usize,
        failed: usize,
    },

    /// Summary of one reminder scan
    RemindersSent { count: usize },

    /// Client connected
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Row id, assigned by the store
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0,
            timestamp: habitlink_util::now(),
            event,
        }
    }
}
