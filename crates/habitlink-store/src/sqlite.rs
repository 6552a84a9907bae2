//! SQLite-based store implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use habitlink_api::{Frequency, Habit, LeaderboardEntry, PastHabit, UserStats};
use habitlink_util::{format_instant, parse_instant, HabitId, UserId};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{
    ArchiveOutcome, AuditEvent, AuditEventType, HabitFilter, HabitGuard, HabitPatch, HabitStore,
    StoreError, StoreResult, UserCounter,
};

const HABIT_COLUMNS: &str = "id, name, goal, unit, frequency, progress, completed, owner_id, \
                             created_at, last_reset, reminder_time";

/// SQLite-based store.
///
/// Queries run on tokio's blocking pool; the connection is shared behind a
/// mutex so calls are serialized.
///
/// With a budget set, a call that has not reached the database within the
/// budget fails without running, and lock waits end when the budget is
/// spent. Keep the budget below any deadline the caller applies so a call
/// reported as failed never commits later.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    budget: Option<Duration>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            budget: None,
        })
    }

    /// Bound each call, lock waits included, to `budget`
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let (budget, called_at) = (self.budget, Instant::now());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            if let Some(budget) = budget {
                let left = budget.saturating_sub(called_at.elapsed());
                if left.is_zero() {
                    return Err(StoreError::Unavailable(format!(
                        "call not started within {budget:?}"
                    )));
                }
                conn.busy_timeout(left)?;
            }
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        -- Live habits
        CREATE TABLE IF NOT EXISTS habits (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            goal REAL NOT NULL,
            unit TEXT,
            frequency TEXT NOT NULL,
            progress REAL NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            owner_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_reset TEXT NOT NULL,
            reminder_time TEXT
        );

        -- Archived habits, keyed by the live habit's id
        CREATE TABLE IF NOT EXISTS past_habits (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            archived_at TEXT NOT NULL,
            habit_json TEXT NOT NULL
        );

        -- Per-user counters
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            habits_finished INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS user_badges (
            user_id TEXT NOT NULL,
            badge_id TEXT NOT NULL,
            PRIMARY KEY (user_id, badge_id)
        );

        -- Audit log (append-only)
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_json TEXT NOT NULL
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_habits_owner ON habits(owner_id);
        CREATE INDEX IF NOT EXISTS idx_habits_reminder ON habits(reminder_time);
        CREATE INDEX IF NOT EXISTS idx_past_habits_owner ON past_habits(owner_id);
        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
        "#,
    )?;

    debug!("Store schema initialized");
    Ok(())
}

/// A habits row before field decoding
struct HabitRow {
    id: String,
    name: String,
    goal: f64,
    unit: Option<String>,
    frequency: String,
    progress: f64,
    completed: bool,
    owner_id: String,
    created_at: String,
    last_reset: String,
    reminder_time: Option<String>,
}

impl HabitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            goal: row.get(2)?,
            unit: row.get(3)?,
            frequency: row.get(4)?,
            progress: row.get(5)?,
            completed: row.get(6)?,
            owner_id: row.get(7)?,
            created_at: row.get(8)?,
            last_reset: row.get(9)?,
            reminder_time: row.get(10)?,
        })
    }

    fn into_habit(self) -> StoreResult<Habit> {
        let corrupt = |what: &str| StoreError::Corrupt(format!("habit {}: {}", self.id, what));
        let instant = |field: &str, raw: &str| {
            parse_instant(raw).ok_or_else(|| corrupt(&format!("bad {} '{}'", field, raw)))
        };

        let id: HabitId = self.id.parse().map_err(|_| corrupt("bad id"))?;
        let frequency: Frequency = self
            .frequency
            .parse()
            .map_err(|e: habitlink_util::HabitError| corrupt(&e.to_string()))?;
        let created_at = instant("created_at", &self.created_at)?;
        let last_reset = instant("last_reset", &self.last_reset)?;
        let reminder_time = match &self.reminder_time {
            Some(raw) => Some(instant("reminder_time", raw)?),
            None => None,
        };

        Ok(Habit {
            id,
            name: self.name,
            goal: self.goal,
            unit: self.unit,
            frequency,
            progress: self.progress,
            completed: self.completed,
            owner_id: UserId::new(self.owner_id),
            created_at,
            last_reset,
            reminder_time,
        })
    }
}

fn text(value: impl ToString) -> Value {
    Value::Text(value.to_string())
}

fn instant_value(at: &DateTime<Utc>) -> Value {
    Value::Text(format_instant(at))
}

fn find_habits_blocking(conn: &Connection, filter: &HabitFilter) -> StoreResult<Vec<Habit>> {
    let mut sql = format!("SELECT {} FROM habits WHERE 1 = 1", HABIT_COLUMNS);
    let mut args: Vec<Value> = Vec::new();

    if let Some(id) = filter.id {
        sql.push_str(" AND id = ?");
        args.push(text(id));
    }
    if let Some(owner) = &filter.owner {
        sql.push_str(" AND owner_id = ?");
        args.push(text(owner));
    }
    if let Some(completed) = filter.completed {
        sql.push_str(" AND completed = ?");
        args.push(Value::Integer(completed as i64));
    }
    if let Some(at) = &filter.reminder_due_at {
        sql.push_str(" AND reminder_time IS NOT NULL AND reminder_time <= ?");
        args.push(instant_value(at));
    }
    sql.push_str(" ORDER BY created_at, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), HabitRow::from_row)?;

    let mut habits = Vec::new();
    for row in rows {
        let row = row?;
        let raw_id = row.id.clone();
        match row.into_habit() {
            Ok(habit) => habits.push(habit),
            Err(e) => warn!(habit_id = %raw_id, error = %e, "Skipping undecodable habit"),
        }
    }

    Ok(habits)
}

fn insert_habit_blocking(conn: &Connection, habit: &Habit) -> StoreResult<HabitId> {
    conn.execute(
        &format!(
            "INSERT INTO habits ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            HABIT_COLUMNS
        ),
        params![
            habit.id.to_string(),
            habit.name,
            habit.goal,
            habit.unit,
            habit.frequency.as_str(),
            habit.progress,
            habit.completed,
            habit.owner_id.as_str(),
            format_instant(&habit.created_at),
            format_instant(&habit.last_reset),
            habit.reminder_time.as_ref().map(format_instant),
        ],
    )?;

    debug!(habit_id = %habit.id, owner_id = %habit.owner_id, "Habit inserted");
    Ok(habit.id)
}

fn update_habit_blocking(
    conn: &Connection,
    id: &HabitId,
    guard: &HabitGuard,
    patch: &HabitPatch,
) -> StoreResult<u64> {
    if patch.is_empty() {
        return Ok(0);
    }

    let mut sets = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    if let Some(progress) = patch.progress {
        sets.push("progress = ?");
        args.push(Value::Real(progress));
    }
    if let Some(completed) = patch.completed {
        sets.push("completed = ?");
        args.push(Value::Integer(completed as i64));
    }
    if let Some(last_reset) = &patch.last_reset {
        sets.push("last_reset = ?");
        args.push(instant_value(last_reset));
    }
    if let Some(reminder_time) = &patch.reminder_time {
        sets.push("reminder_time = ?");
        args.push(reminder_time.as_ref().map_or(Value::Null, instant_value));
    }

    let mut sql = format!("UPDATE habits SET {} WHERE id = ?", sets.join(", "));
    args.push(text(id));

    push_guard(&mut sql, &mut args, guard);

    let matched = conn.execute(&sql, params_from_iter(args))?;
    debug!(habit_id = %id, matched, "Habit update");
    Ok(matched as u64)
}

/// Append `guard` as `AND` clauses to a statement filtering on one habit
fn push_guard(sql: &mut String, args: &mut Vec<Value>, guard: &HabitGuard) {
    if let Some(owner) = &guard.owner {
        sql.push_str(" AND owner_id = ?");
        args.push(text(owner));
    }
    if let Some(last_reset) = &guard.last_reset {
        sql.push_str(" AND last_reset = ?");
        args.push(instant_value(last_reset));
    }
    if let Some(progress) = guard.progress {
        sql.push_str(" AND progress = ?");
        args.push(Value::Real(progress));
    }
    if let Some(completed) = guard.completed {
        sql.push_str(" AND completed = ?");
        args.push(Value::Integer(completed as i64));
    }
    match &guard.reminder_time {
        Some(Some(at)) => {
            sql.push_str(" AND reminder_time = ?");
            args.push(instant_value(at));
        }
        Some(None) => sql.push_str(" AND reminder_time IS NULL"),
        None => {}
    }
}

fn insert_past_habit_blocking(conn: &Connection, past: &PastHabit) -> StoreResult<bool> {
    let json = serde_json::to_string(past)?;
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO past_habits (id, owner_id, archived_at, habit_json)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            past.id().to_string(),
            past.habit.owner_id.as_str(),
            format_instant(&past.archived_at),
            json
        ],
    )?;
    Ok(inserted == 1)
}

fn increment_counter_blocking(
    conn: &Connection,
    user: &UserId,
    counter: UserCounter,
    by: i64,
) -> StoreResult<()> {
    let column = counter.column();
    conn.execute(
        &format!(
            r#"
            INSERT INTO users (user_id, {column}) VALUES (?1, MAX(?2, 0))
            ON CONFLICT(user_id)
            DO UPDATE SET {column} = MAX({column} + ?2, 0)
            "#
        ),
        params![user.as_str(), by],
    )?;

    debug!(user_id = %user, counter = column, by, "User counter updated");
    Ok(())
}

#[async_trait]
impl HabitStore for SqliteStore {
    async fn find_habits(&self, filter: &HabitFilter) -> StoreResult<Vec<Habit>> {
        let filter = filter.clone();
        self.with_conn(move |conn| find_habits_blocking(conn, &filter))
            .await
    }

    async fn insert_habit(&self, habit: &Habit) -> StoreResult<HabitId> {
        let habit = habit.clone();
        self.with_conn(move |conn| insert_habit_blocking(conn, &habit))
            .await
    }

    async fn update_habit(
        &self,
        id: &HabitId,
        guard: &HabitGuard,
        patch: &HabitPatch,
    ) -> StoreResult<u64> {
        let (id, guard, patch) = (*id, guard.clone(), patch.clone());
        self.with_conn(move |conn| update_habit_blocking(conn, &id, &guard, &patch))
            .await
    }

    async fn delete_habit(&self, id: &HabitId) -> StoreResult<u64> {
        let id = *id;
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM habits WHERE id = ?", [id.to_string()])?;
            debug!(habit_id = %id, deleted, "Habit delete");
            Ok(deleted as u64)
        })
        .await
    }

    async fn replace_habit(
        &self,
        old_id: &HabitId,
        guard: &HabitGuard,
        fresh: &Habit,
    ) -> StoreResult<bool> {
        let (old_id, guard, fresh) = (*old_id, guard.clone(), fresh.clone());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            insert_habit_blocking(&tx, &fresh)?;

            let mut sql = String::from("DELETE FROM habits WHERE id = ?");
            let mut args = vec![text(&old_id)];
            push_guard(&mut sql, &mut args, &guard);
            if tx.execute(&sql, params_from_iter(args))? == 0 {
                // Dropping the transaction rolls the insert back
                debug!(habit_id = %old_id, "Habit changed or gone, not replaced");
                return Ok(false);
            }

            tx.commit()?;
            debug!(old_id = %old_id, new_id = %fresh.id, "Habit replaced");
            Ok(true)
        })
        .await
    }

    async fn insert_past_habit(&self, past: &PastHabit) -> StoreResult<HabitId> {
        let past = past.clone();
        self.with_conn(move |conn| {
            insert_past_habit_blocking(conn, &past)?;
            Ok(past.id())
        })
        .await
    }

    async fn archive_habit(&self, past: &PastHabit) -> StoreResult<ArchiveOutcome> {
        let past = past.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let newly_archived = insert_past_habit_blocking(&tx, &past)?;
            if newly_archived {
                increment_counter_blocking(
                    &tx,
                    &past.habit.owner_id,
                    UserCounter::HabitsFinished,
                    1,
                )?;
            }
            let removed = tx.execute(
                "DELETE FROM habits WHERE id = ?",
                [past.id().to_string()],
            )?;

            tx.commit()?;

            debug!(
                habit_id = %past.id(),
                newly_archived,
                removed,
                "Habit archived"
            );
            Ok(ArchiveOutcome {
                newly_archived,
                removed: removed as u64,
            })
        })
        .await
    }

    async fn list_past_habits(&self, owner: &UserId) -> StoreResult<Vec<PastHabit>> {
        let owner = owner.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT habit_json FROM past_habits WHERE owner_id = ? ORDER BY archived_at DESC, id",
            )?;
            let rows = stmt.query_map([owner.as_str()], |row| row.get::<_, String>(0))?;

            let mut past = Vec::new();
            for row in rows {
                past.push(serde_json::from_str(&row?)?);
            }
            Ok(past)
        })
        .await
    }

    async fn increment_user_counter(
        &self,
        user: &UserId,
        counter: UserCounter,
        by: i64,
    ) -> StoreResult<()> {
        let user = user.clone();
        self.with_conn(move |conn| increment_counter_blocking(conn, &user, counter, by))
            .await
    }

    async fn user_stats(&self, user: &UserId) -> StoreResult<UserStats> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let finished: Option<i64> = conn
                .query_row(
                    "SELECT habits_finished FROM users WHERE user_id = ?",
                    [user.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let mut stmt =
                conn.prepare("SELECT badge_id FROM user_badges WHERE user_id = ? ORDER BY badge_id")?;
            let badges = stmt
                .query_map([user.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;

            Ok(UserStats {
                user_id: user,
                habits_finished: finished.unwrap_or(0).max(0) as u64,
                badges_collected: badges,
            })
        })
        .await
    }

    async fn top_users(&self, limit: usize) -> StoreResult<Vec<LeaderboardEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT user_id, habits_finished FROM users
                WHERE habits_finished > 0
                ORDER BY habits_finished DESC, user_id ASC
                LIMIT ?
                "#,
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok(LeaderboardEntry {
                    user_id: UserId::new(row.get::<_, String>(0)?),
                    habits_finished: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })?;

            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn add_badge(&self, user: &UserId, badge_id: &str) -> StoreResult<bool> {
        let (user, badge_id) = (user.clone(), badge_id.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO users (user_id) VALUES (?)",
                [user.as_str()],
            )?;
            let added = tx.execute(
                "INSERT OR IGNORE INTO user_badges (user_id, badge_id) VALUES (?1, ?2)",
                params![user.as_str(), badge_id],
            )?;
            tx.commit()?;

            debug!(user_id = %user, badge_id = %badge_id, added = added == 1, "Badge collected");
            Ok(added == 1)
        })
        .await
    }

    async fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let event_json = serde_json::to_string(&event.event)?;

            conn.execute(
                "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
                params![format_instant(&event.timestamp), event_json],
            )?;

            debug!(event_id = conn.last_insert_rowid(), "Audit event appended");
            Ok(())
        })
        .await
    }

    async fn recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
            )?;

            let rows = stmt.query_map([limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let timestamp: String = row.get(1)?;
                let event_json: String = row.get(2)?;
                Ok((id, timestamp, event_json))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, timestamp, event_json) = row?;
                let timestamp = parse_instant(&timestamp).unwrap_or_else(habitlink_util::now);
                let event: AuditEventType = serde_json::from_str(&event_json)?;
                events.push(AuditEvent {
                    id,
                    timestamp,
                    event,
                });
            }

            Ok(events)
        })
        .await
    }

    async fn is_healthy(&self) -> bool {
        let result = self
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |_| Ok(()))?))
            .await;
        if let Err(e) = &result {
            warn!(error = %e, "Store health check failed");
        }
        result.is_ok()
    }
}
