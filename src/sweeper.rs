use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use ulid::Ulid;

use crate::cache::AvailabilityCache;
use crate::engine::Engine;

/// Background task that periodically drops expired cache entries.
pub async fn run_sweeper(cache: Arc<AvailabilityCache>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let removed = cache.sweep_expired();
        if removed > 0 {
            debug!("swept {removed} expired cache entries");
        }
    }
}

/// What the preload loop warms on every tick.
#[derive(Debug, Clone)]
pub struct PreloadPlan {
    pub services: Vec<Ulid>,
    pub duration_minutes: u32,
    pub look_ahead_days: u32,
    pub every: Duration,
}

/// Background task that keeps the look-ahead window of each configured
/// service warm. Failures are logged by the preloader and never stop the loop.
pub async fn run_preloader(engine: Arc<Engine>, plan: PreloadPlan) {
    if plan.services.is_empty() {
        return;
    }
    info!(
        "preloading {} services every {}s",
        plan.services.len(),
        plan.every.as_secs()
    );
    let mut interval = tokio::time::interval(plan.every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let today = chrono::Local::now().date_naive();
        for &service in &plan.services {
            engine
                .preload(Some(service), plan.duration_minutes, plan.look_ahead_days, today)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::cache::{CacheKey, CachePayload};
    use crate::invalidation::InvalidationBus;
    use crate::model::*;
    use crate::source::InMemoryStore;

    fn day() -> DateAvailability {
        DateAvailability::from_summary(
            NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            &Summary::of(&[]),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drops_expired_entries() {
        let cache = Arc::new(AvailabilityCache::new(Duration::from_secs(10)));
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        cache.set(CacheKey::day(date, None, 60), CachePayload::Day(day()), None);
        cache.set(
            CacheKey::day(date, None, 120),
            CachePayload::Day(day()),
            Some(Duration::from_secs(3600)),
        );

        let task = tokio::spawn(run_sweeper(cache.clone(), Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 1);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn preloader_warms_configured_services() {
        let bus = Arc::new(InvalidationBus::new());
        let store = Arc::new(InMemoryStore::new(bus.clone()));
        let service = Ulid::new();
        store.upsert_service(ServiceRecord {
            id: service,
            name: "Pressure washing".into(),
            base_price: 100.0,
            price_per_hour: 60.0,
        });
        let engine = Arc::new(Engine::new(
            Schedule::default(),
            Arc::new(AvailabilityCache::default()),
            bus,
            store.clone(),
            store,
        ));

        let plan = PreloadPlan {
            services: vec![service],
            duration_minutes: 60,
            look_ahead_days: 3,
            every: Duration::from_secs(600),
        };
        let task = tokio::spawn(run_preloader(engine.clone(), plan));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Three day entries plus the bulk entry.
        assert_eq!(engine.cache_len(), 4);
        task.abort();
    }

    #[tokio::test]
    async fn preloader_without_services_returns() {
        let bus = Arc::new(InvalidationBus::new());
        let store = Arc::new(InMemoryStore::new(bus.clone()));
        let engine = Arc::new(Engine::new(
            Schedule::default(),
            Arc::new(AvailabilityCache::default()),
            bus,
            store.clone(),
            store,
        ));
        let plan = PreloadPlan {
            services: Vec::new(),
            duration_minutes: 60,
            look_ahead_days: 3,
            every: Duration::from_secs(1),
        };
        run_preloader(engine, plan).await;
    }
}
