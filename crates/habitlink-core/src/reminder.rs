//! Reminder calculation

use chrono::{DateTime, Utc};
use habitlink_api::{Frequency, Habit};
use habitlink_config::ReschedulePolicy;
use habitlink_util::{add_days, at_utc_hour, Result};

/// Hour of day (UTC) at which reminders fall due
pub const REMINDER_HOUR: u32 = 18;

const WEEKLY_LEAD_DAYS: u64 = 6;
const MONTHLY_LEAD_DAYS: u64 = 28;

/// Next reminder due-time for a habit of `frequency`, relative to `reference`.
///
/// - daily: 18:00 on the reference day, or 18:00 the next day if the
///   reference is already at or past 18:00
/// - weekly: 18:00 six days after the reference
/// - monthly: 18:00 twenty-eight days after the reference
///
/// The result is strictly after `reference`. Instants beyond chrono's range
/// saturate to `DateTime::<Utc>::MAX_UTC`, which never falls due.
pub fn compute_next_reminder(frequency: Frequency, reference: DateTime<Utc>) -> DateTime<Utc> {
    let next = match frequency {
        Frequency::Daily => at_utc_hour(reference, REMINDER_HOUR).and_then(|today| {
            if today > reference {
                Some(today)
            } else {
                add_days(today, 1)
            }
        }),
        Frequency::Weekly => add_days(reference, WEEKLY_LEAD_DAYS)
            .and_then(|day| at_utc_hour(day, REMINDER_HOUR)),
        Frequency::Monthly => add_days(reference, MONTHLY_LEAD_DAYS)
            .and_then(|day| at_utc_hour(day, REMINDER_HOUR)),
    };
    next.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Like [`compute_next_reminder`], for a frequency that has not been parsed yet
pub fn compute_next_reminder_str(frequency: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Ok(compute_next_reminder(frequency.parse()?, reference))
}

/// Next due-time of a reminder surfaced at `now`
pub fn reschedule(policy: ReschedulePolicy, frequency: Frequency, now: DateTime<Utc>) -> DateTime<Utc> {
    match policy {
        ReschedulePolicy::Frequency => compute_next_reminder(frequency, now),
        ReschedulePolicy::Fixed(every) => chrono::Duration::from_std(every)
            .ok()
            .and_then(|every| now.checked_add_signed(every))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

/// The text delivered for a due reminder
pub fn reminder_message(habit: &Habit) -> String {
    let remaining = format_amount(habit.remaining());
    match &habit.unit {
        Some(unit) => format!(
            "Reminder: It's time to complete your habit \"{}\"! You only have {} {} left to go!",
            habit.name, remaining, unit
        ),
        None => format!(
            "Reminder: It's time to complete your habit \"{}\"! You only have {} left to go!",
            habit.name, remaining
        ),
    }
}

/// Whole numbers print without a fractional part; float noise is rounded off
fn format_amount(amount: f64) -> String {
    let rounded = (amount * 1_000_000.0).round() / 1_000_000.0;
    format!("{}", rounded)
}
