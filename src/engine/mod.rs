mod bulk;
mod conflict;
mod error;
mod preload;
mod queries;
mod slots;

pub use conflict::resolve;
pub use error::EngineError;
pub use preload::PreloadReport;
pub use slots::{generate_slots, slots_for};

use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::cache::{AvailabilityCache, CacheStats};
use crate::invalidation::{InvalidationBus, InvalidatorId};
use crate::model::*;
use crate::source::{BookingSource, ServiceCatalog};

/// Availability engine: slot generation and conflict resolution over the
/// booking source, served through the shared cache.
///
/// The cache is owned by the caller and injected; the engine registers it on
/// the bus at construction so that every committed booking mutation clears
/// the affected entries before any other invalidator runs.
pub struct Engine {
    schedule: Schedule,
    cache: Arc<AvailabilityCache>,
    bus: Arc<InvalidationBus>,
    bookings: Arc<dyn BookingSource>,
    services: Arc<dyn ServiceCatalog>,
    cache_invalidator: Option<InvalidatorId>,
}

impl Engine {
    pub fn new(
        schedule: Schedule,
        cache: Arc<AvailabilityCache>,
        bus: Arc<InvalidationBus>,
        bookings: Arc<dyn BookingSource>,
        services: Arc<dyn ServiceCatalog>,
    ) -> Self {
        let cache_invalidator = bus.register(cache.clone());
        if cache_invalidator.is_none() {
            tracing::error!("could not register cache invalidator; cached answers only expire by TTL");
        }
        Self {
            schedule,
            cache,
            bus,
            bookings,
            services,
            cache_invalidator,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn cache(&self) -> &Arc<AvailabilityCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    /// Entry point for mutation collaborators that commit elsewhere.
    /// Returns how many invalidators failed.
    pub fn on_booking_mutated(&self, date: NaiveDate, service_id: Option<Ulid>) -> usize {
        self.bus.invalidate(Some(date), service_id)
    }

    // ── Introspection ────────────────────────────────────────

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_keys(&self) -> Vec<String> {
        self.cache.keys()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(id) = self.cache_invalidator.take() {
            self.bus.unregister(id);
        }
    }
}
