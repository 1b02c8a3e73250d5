use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::types::Schedule;

/// Compute the next UTC fire time for `schedule` strictly after `from`.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Interval { every_secs } => Some(from + Duration::seconds(*every_secs as i64)),

        Schedule::Daily { .. } => {
            let candidate = occurrence_on(schedule, from)?;
            if candidate > from {
                Some(candidate)
            } else {
                // Today's window has passed, advance to tomorrow.
                Some(candidate + Duration::days(1))
            }
        }
    }
}

/// Whether a trigger last fired (or armed) at `last_fired` should fire at `now`.
///
/// A daily trigger is due when its most recent window at or before `now` lies
/// after `last_fired`. Any number of missed windows collapse into one firing.
pub fn is_due(schedule: &Schedule, last_fired: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match schedule {
        Schedule::Interval { every_secs } => {
            now >= last_fired + Duration::seconds(*every_secs as i64)
        }
        Schedule::Daily { .. } => {
            latest_occurrence(schedule, now).is_some_and(|window| window > last_fired)
        }
    }
}

/// Most recent daily window at or before `now`.
fn latest_occurrence(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = occurrence_on(schedule, now)?;
    if today <= now {
        Some(today)
    } else {
        Some(today - Duration::days(1))
    }
}

/// The daily window on the calendar day of `day`.
fn occurrence_on(schedule: &Schedule, day: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let Schedule::Daily { hour, minute } = schedule else {
        return None;
    };
    Utc.with_ymd_and_hms(
        day.year(),
        day.month(),
        day.day(),
        u32::from(*hour),
        u32::from(*minute),
        0,
    )
    .single()
}
