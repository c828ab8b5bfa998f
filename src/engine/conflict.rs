use chrono::NaiveTime;

use crate::model::*;

pub(crate) const BOOKED_REASON: &str = "already booked";

/// Mark every candidate available or blocked against `bookings`.
///
/// Bookings that are cancelled, belong to another service (when the query
/// names one), or carry the query's `exclude_booking_id` never conflict.
/// `service_info` is left empty; the engine attaches it.
pub fn resolve(
    query: &AvailabilityQuery,
    candidates: &[NaiveTime],
    bookings: &[BookingRecord],
) -> AvailabilityResult {
    let blocking = blocking_spans(query, bookings);
    let duration_ms = Ms::from(query.duration_minutes) * MINUTE_MS;

    let slots: Vec<TimeSlot> = candidates
        .iter()
        .map(|&time| {
            let start = instant(query.date, time);
            let slot = Span::new(start, start + duration_ms);
            let conflicts = count_overlapping(&blocking, &slot);
            TimeSlot {
                time,
                available: conflicts == 0,
                reason: (conflicts > 0).then(|| BOOKED_REASON.to_string()),
                conflicting_bookings: conflicts,
            }
        })
        .collect();

    let summary = Summary::of(&slots);
    AvailabilityResult {
        date: query.date,
        service_id: query.service_id,
        duration: hours_from_minutes(query.duration_minutes),
        slots,
        summary,
        service_info: None,
    }
}

/// Spans of bookings that can conflict with this query, sorted by start.
fn blocking_spans(query: &AvailabilityQuery, bookings: &[BookingRecord]) -> Vec<Span> {
    let mut spans: Vec<Span> = bookings
        .iter()
        .filter(|b| b.status.blocks())
        .filter(|b| query.exclude_booking_id != Some(b.id))
        .filter(|b| query.service_id.is_none_or(|s| s == b.service_id))
        .filter(|b| b.start < b.end)
        .map(BookingRecord::span)
        .collect();
    spans.sort_by_key(|s| s.start);
    spans
}

/// `sorted` must be ordered by start. Everything at or past the partition
/// point starts at or after `slot.end`, so it cannot overlap.
fn count_overlapping(sorted: &[Span], slot: &Span) -> u32 {
    let right_bound = sorted.partition_point(|b| b.start < slot.end);
    sorted[..right_bound]
        .iter()
        .filter(|b| b.end > slot.start)
        .count() as u32
}
