use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::cache::{CacheKey, CachePayload};
use crate::limits::MAX_BULK_DATES;
use crate::model::*;
use crate::source::SourceError;

use super::conflict::resolve;
use super::slots::slots_for;
use super::{Engine, EngineError};

/// Bucket a batched fetch by booking date.
pub(super) fn group_by_date(bookings: Vec<BookingRecord>) -> HashMap<NaiveDate, Vec<BookingRecord>> {
    let mut by_date: HashMap<NaiveDate, Vec<BookingRecord>> = HashMap::new();
    for booking in bookings {
        by_date.entry(booking.date).or_default().push(booking);
    }
    by_date
}

impl Engine {
    /// Day-level availability for `dates`, sorted ascending and deduplicated.
    ///
    /// Served from the bulk entry when present, else from per-date entries;
    /// whatever is still missing is fetched in one batched query.
    pub async fn get_bulk_availability(
        &self,
        dates: &[NaiveDate],
        service_id: Option<Ulid>,
        duration_minutes: u32,
    ) -> Result<Arc<Vec<DateAvailability>>, EngineError> {
        if dates.len() > MAX_BULK_DATES {
            return Err(EngineError::LimitExceeded("too many dates in bulk query"));
        }
        self.validate_duration(duration_minutes)?;
        if dates.is_empty() {
            return Ok(Arc::new(Vec::new()));
        }

        let key = CacheKey::bulk(dates, service_id, duration_minutes);
        if let Some(hit) = self.cache.get_bulk(&key) {
            return Ok(hit);
        }
        self.service_info(service_id, duration_minutes).await?;

        let epoch = self.cache.epoch();
        let mut wanted = dates.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let mut days: BTreeMap<NaiveDate, DateAvailability> = BTreeMap::new();
        let mut missing = Vec::new();
        for date in wanted {
            match self.cache.get_day(&CacheKey::day(date, service_id, duration_minutes)) {
                Some(day) => {
                    days.insert(date, day);
                }
                None => missing.push(date),
            }
        }

        if !missing.is_empty() {
            debug!("bulk query: {} of {} dates need a fetch", missing.len(), dates.len());
            let mut grouped = self.fetch_days(&missing, service_id).await?;
            for date in missing {
                let bookings = grouped.remove(&date).unwrap_or_default();
                let day = self.day_availability(date, service_id, duration_minutes, &bookings);
                self.cache.set_since(
                    epoch,
                    CacheKey::day(date, service_id, duration_minutes),
                    CachePayload::Day(day.clone()),
                    None,
                );
                days.insert(date, day);
            }
        }

        let result = Arc::new(days.into_values().collect::<Vec<_>>());
        self.cache
            .set_since(epoch, key, CachePayload::Bulk(result.clone()), None);
        Ok(result)
    }

    /// Bookings for every date in `dates` (sorted), grouped by date. One
    /// range query when the span is short, else one query per date.
    pub(super) async fn fetch_days(
        &self,
        dates: &[NaiveDate],
        service_id: Option<Ulid>,
    ) -> Result<HashMap<NaiveDate, Vec<BookingRecord>>, SourceError> {
        let (Some(&first), Some(&last)) = (dates.first(), dates.last()) else {
            return Ok(HashMap::new());
        };
        if (last - first).num_days() < MAX_BULK_DATES as i64 {
            let bookings = self.bookings.bookings_between(first, last, service_id).await?;
            return Ok(group_by_date(bookings));
        }
        let mut grouped = HashMap::new();
        for &date in dates {
            grouped.insert(date, self.bookings.bookings_on(date, service_id, None).await?);
        }
        Ok(grouped)
    }

    /// Coarse shading for one date from already-fetched bookings.
    pub(super) fn day_availability(
        &self,
        date: NaiveDate,
        service_id: Option<Ulid>,
        duration_minutes: u32,
        bookings: &[BookingRecord],
    ) -> DateAvailability {
        let query = AvailabilityQuery {
            date,
            service_id,
            duration_minutes,
            exclude_booking_id: None,
        };
        let candidates = slots_for(&self.schedule, date, duration_minutes);
        let result = resolve(&query, &candidates, bookings);
        DateAvailability::from_summary(date, &result.summary)
    }
}
