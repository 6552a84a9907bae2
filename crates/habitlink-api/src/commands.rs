//! Command types for the habitlinkd protocol

use habitlink_util::{ClientId, HabitError, HabitId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    DueReminder, Habit, HealthStatus, LeaderboardEntry, NewHabit, PastHabit, ProgressDelta,
    RecurrenceOutcome, UserStats, API_VERSION,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    /// Whether repeating the same request may succeed
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&HabitError> for ErrorInfo {
    fn from(err: &HabitError) -> Self {
        let code = match err {
            HabitError::InvalidFrequency(_) => ErrorCode::InvalidFrequency,
            HabitError::InvalidDelta(_) => ErrorCode::InvalidDelta,
            HabitError::NotFound(_) => ErrorCode::NotFound,
            HabitError::Validation(_) => ErrorCode::InvalidRequest,
            HabitError::Store(_) => ErrorCode::StoreUnavailable,
            HabitError::StoreTimeout(_) => ErrorCode::StoreTimeout,
            HabitError::AlreadyRunning | HabitError::NotRunning | HabitError::Internal(_) => {
                ErrorCode::InternalError
            }
        };

        Self {
            code,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    InvalidFrequency,
    InvalidDelta,
    StoreUnavailable,
    StoreTimeout,
    PermissionDenied,
    RateLimited,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create a habit for a user
    CreateHabit { user_id: UserId, habit: NewHabit },

    /// List a user's live habits
    ListHabits { user_id: UserId },

    /// Log progress on a habit
    UpdateProgress {
        user_id: UserId,
        habit_id: HabitId,
        delta: ProgressDelta,
    },

    /// Finish a habit: archive it and count it for the user
    ArchiveHabit { user_id: UserId, habit_id: HabitId },

    /// List a user's archived habits
    ListPastHabits { user_id: UserId },

    /// Pull the user's due reminders (advances their due-times)
    DueReminders { user_id: UserId },

    /// Counters for a user
    UserStats { user_id: UserId },

    /// Record a collected badge
    CollectBadge { user_id: UserId, badge_id: String },

    /// Individual leaderboard
    Leaderboard { limit: Option<usize> },

    /// Get health status
    GetHealth,

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    // Admin commands

    /// Run a recurrence tick now (admin only)
    RunRecurrence,

    /// Run a global reminder scan now (admin only)
    ScanReminders,

    /// Ping for keepalive
    Ping,
}

impl Command {
    pub fn requires_admin(&self) -> bool {
        matches!(self, Command::RunRecurrence | Command::ScanReminders)
    }
}

/// Response payloads. Lists sit in named fields: the internal tag cannot
/// be attached to a bare sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    HabitCreated(Habit),
    Habits { habits: Vec<Habit> },
    HabitUpdated(Habit),
    HabitArchived(PastHabit),
    PastHabits { past_habits: Vec<PastHabit> },
    Reminders { reminders: Vec<DueReminder> },
    UserStats(UserStats),
    BadgeCollected,
    Leaderboard { entries: Vec<LeaderboardEntry> },
    Health(HealthStatus),
    Subscribed { client_id: ClientId },
    Unsubscribed,
    RecurrenceRan { outcomes: Vec<RecurrenceOutcome> },
    /// A manual job was requested while the same job was already running
    JobBusy,
    Pong,
}
