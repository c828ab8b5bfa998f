use chrono::{NaiveDate, NaiveTime, Timelike};

use crate::model::*;

// ── Slot Generation ───────────────────────────────────────────────

/// Candidate start times inside `hours`, one every `granularity_minutes`,
/// keeping only those whose `start + duration` still ends by `hours.close`.
///
/// Output is strictly ascending. "Next available" lookups rely on that order.
pub fn generate_slots(
    hours: &BusinessHours,
    duration_minutes: u32,
    granularity_minutes: u32,
) -> Vec<NaiveTime> {
    let step = granularity_minutes.max(1);
    let open = hours.open.num_seconds_from_midnight() / 60;
    let close = hours.close.num_seconds_from_midnight() / 60;

    let mut slots = Vec::new();
    let mut start = open;
    while start + duration_minutes <= close {
        if let Some(t) = NaiveTime::from_num_seconds_from_midnight_opt(start * 60, 0) {
            slots.push(t);
        }
        start += step;
    }
    slots
}

/// Candidates for `date` under `schedule`. Closed days yield nothing.
pub fn slots_for(schedule: &Schedule, date: NaiveDate, duration_minutes: u32) -> Vec<NaiveTime> {
    match schedule.hours_on(date) {
        Some(hours) => generate_slots(&hours, duration_minutes, schedule.granularity_minutes),
        None => Vec::new(),
    }
}
