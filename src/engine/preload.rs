use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::cache::{CacheKey, CachePayload};
use crate::limits::MAX_LOOKAHEAD_DAYS;
use crate::model::*;

use super::bulk::group_by_date;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PreloadReport {
    /// Dates written to the cache.
    pub populated: usize,
    /// Dates skipped because their bookings could not be read.
    pub failed: usize,
}

impl Engine {
    /// Warm the cache with day-level availability for `look_ahead_days`
    /// consecutive dates starting the day after `today`.
    ///
    /// Never fails: errors are logged and counted in the report. When the
    /// batched fetch fails each date is retried alone, so one bad date does
    /// not lose the others. The bulk entry is written only when every date
    /// was populated.
    pub async fn preload(
        &self,
        service_id: Option<Ulid>,
        duration_minutes: u32,
        look_ahead_days: u32,
        today: NaiveDate,
    ) -> PreloadReport {
        let started = std::time::Instant::now();
        let days = look_ahead_days.min(MAX_LOOKAHEAD_DAYS) as usize;
        if look_ahead_days as usize > days {
            warn!("preload look-ahead {look_ahead_days} capped at {days} days");
        }
        let dates: Vec<NaiveDate> = today.iter_days().skip(1).take(days).collect();

        let report = match self.preload_dates(&dates, service_id, duration_minutes).await {
            Ok(report) => report,
            Err(e) => {
                warn!("preload aborted: {e}");
                PreloadReport {
                    populated: 0,
                    failed: dates.len(),
                }
            }
        };
        if report.failed > 0 {
            metrics::counter!(crate::observability::PRELOAD_FAILURES_TOTAL)
                .increment(report.failed as u64);
        }
        metrics::histogram!(crate::observability::PRELOAD_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(
            "preloaded {} dates ({} failed) for service {}",
            report.populated,
            report.failed,
            service_id.map_or_else(|| "*".to_string(), |id| id.to_string()),
        );
        report
    }

    async fn preload_dates(
        &self,
        dates: &[NaiveDate],
        service_id: Option<Ulid>,
        duration_minutes: u32,
    ) -> Result<PreloadReport, EngineError> {
        self.validate_duration(duration_minutes)?;
        self.service_info(service_id, duration_minutes).await?;
        let (Some(&first), Some(&last)) = (dates.first(), dates.last()) else {
            return Ok(PreloadReport::default());
        };

        let epoch = self.cache.epoch();
        let mut batched: Option<HashMap<NaiveDate, Vec<BookingRecord>>> =
            match self.bookings.bookings_between(first, last, service_id).await {
                Ok(bookings) => Some(group_by_date(bookings)),
                Err(e) => {
                    warn!("batched preload fetch {first}..={last} failed, retrying per date: {e}");
                    None
                }
            };

        let mut populated = Vec::with_capacity(dates.len());
        let mut failed = 0;
        for &date in dates {
            let bookings = match batched.as_mut() {
                Some(grouped) => grouped.remove(&date).unwrap_or_default(),
                None => match self.bookings.bookings_on(date, service_id, None).await {
                    Ok(bookings) => bookings,
                    Err(e) => {
                        warn!("preload skipped {date}: {e}");
                        failed += 1;
                        continue;
                    }
                },
            };
            let day = self.day_availability(date, service_id, duration_minutes, &bookings);
            self.cache.set_since(
                epoch,
                CacheKey::day(date, service_id, duration_minutes),
                CachePayload::Day(day.clone()),
                None,
            );
            populated.push(day);
        }

        let report = PreloadReport {
            populated: populated.len(),
            failed,
        };
        if failed == 0 {
            self.cache.set_since(
                epoch,
                CacheKey::bulk(dates, service_id, duration_minutes),
                CachePayload::Bulk(std::sync::Arc::new(populated)),
                None,
            );
        }
        Ok(report)
    }
}
