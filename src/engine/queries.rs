use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::cache::{CacheKey, CachePayload};
use crate::model::*;

use super::conflict::resolve;
use super::slots::slots_for;
use super::{Engine, EngineError};

impl Engine {
    /// Reject a duration before touching the cache or any source.
    pub(super) fn validate_duration(&self, duration_minutes: u32) -> Result<(), EngineError> {
        if duration_minutes == 0 {
            return Err(EngineError::InvalidQuery("duration must be positive".into()));
        }
        let longest = self.schedule.longest_window_minutes();
        if duration_minutes > longest {
            return Err(EngineError::InvalidQuery(format!(
                "duration of {}h exceeds business hours ({}h)",
                hours_from_minutes(duration_minutes),
                hours_from_minutes(longest),
            )));
        }
        Ok(())
    }

    /// Pricing snapshot for the queried service; unknown ids are an error.
    pub(super) async fn service_info(
        &self,
        service_id: Option<Ulid>,
        duration_minutes: u32,
    ) -> Result<Option<ServiceInfo>, EngineError> {
        let Some(id) = service_id else {
            return Ok(None);
        };
        let service = self
            .services
            .service(id)
            .await?
            .ok_or(EngineError::ServiceNotFound(id))?;
        Ok(Some(ServiceInfo::snapshot(&service, duration_minutes)))
    }

    /// Uncached resolution: generate candidates, fetch bookings, resolve.
    pub async fn compute_availability(
        &self,
        query: &AvailabilityQuery,
    ) -> Result<AvailabilityResult, EngineError> {
        self.validate_duration(query.duration_minutes)?;
        let service_info = self
            .service_info(query.service_id, query.duration_minutes)
            .await?;
        let candidates = slots_for(&self.schedule, query.date, query.duration_minutes);
        let bookings = if candidates.is_empty() {
            Vec::new()
        } else {
            self.bookings
                .bookings_on(query.date, query.service_id, query.exclude_booking_id)
                .await?
        };

        let mut result = resolve(query, &candidates, &bookings);
        result.service_info = service_info;
        Ok(result)
    }

    /// Cached fine-grained availability.
    pub async fn get_availability(
        &self,
        query: &AvailabilityQuery,
    ) -> Result<Arc<AvailabilityResult>, EngineError> {
        self.validate_duration(query.duration_minutes)?;
        let key = CacheKey::slots(query);
        if let Some(hit) = self.cache.get_slots(&key) {
            return Ok(hit);
        }
        let epoch = self.cache.epoch();
        let result = Arc::new(self.compute_availability(query).await?);
        self.cache
            .set_since(epoch, key, CachePayload::Slots(result.clone()), None);
        Ok(result)
    }

    /// Like [`get_availability`](Engine::get_availability), but gives up as
    /// soon as `token` is cancelled. A cancelled computation returns
    /// `Ok(None)` and never writes to the cache.
    pub async fn get_availability_cancellable(
        &self,
        query: &AvailabilityQuery,
        token: &CancellationToken,
    ) -> Result<Option<Arc<AvailabilityResult>>, EngineError> {
        self.validate_duration(query.duration_minutes)?;
        let key = CacheKey::slots(query);
        if let Some(hit) = self.cache.get_slots(&key) {
            return Ok(Some(hit));
        }

        let epoch = self.cache.epoch();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            result = self.compute_availability(query) => Arc::new(result?),
        };
        if token.is_cancelled() {
            return Ok(None);
        }
        self.cache
            .set_since(epoch, key, CachePayload::Slots(result.clone()), None);
        Ok(Some(result))
    }

    /// First free slot of the day in generator order. A cached per-day
    /// summary showing no free slots answers without reading bookings; it
    /// does not apply when a booking is excluded.
    pub async fn next_available(
        &self,
        query: &AvailabilityQuery,
    ) -> Result<Option<TimeSlot>, EngineError> {
        self.validate_duration(query.duration_minutes)?;
        if query.exclude_booking_id.is_none()
            && let Some(day) = self.cache.get_day(&CacheKey::day(
                query.date,
                query.service_id,
                query.duration_minutes,
            ))
            && day.available_slots == 0
        {
            return Ok(None);
        }
        let result = self.get_availability(query).await?;
        Ok(result.next_available().cloned())
    }
}
