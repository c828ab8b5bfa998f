use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use ulid::Ulid;

use crate::invalidation::{Invalidator, InvalidatorError, Scope};
use crate::model::*;
use crate::observability::{CACHE_ENTRIES, CACHE_EVICTIONS_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Typed cache key. Its [`fingerprint`](CacheKey::fingerprint) is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Fine-grained slot query.
    Slots {
        date: NaiveDate,
        service_id: Option<Ulid>,
        duration_minutes: u32,
        exclude_booking_id: Option<Ulid>,
    },
    /// Bulk day-level query. `dates` is sorted and deduplicated.
    Bulk {
        dates: Vec<NaiveDate>,
        service_id: Option<Ulid>,
        duration_minutes: u32,
    },
    /// Per-date index into bulk/preloaded results.
    Day {
        date: NaiveDate,
        service_id: Option<Ulid>,
        duration_minutes: u32,
    },
}

impl CacheKey {
    pub fn slots(query: &AvailabilityQuery) -> Self {
        CacheKey::Slots {
            date: query.date,
            service_id: query.service_id,
            duration_minutes: query.duration_minutes,
            exclude_booking_id: query.exclude_booking_id,
        }
    }

    pub fn bulk(dates: &[NaiveDate], service_id: Option<Ulid>, duration_minutes: u32) -> Self {
        let mut dates = dates.to_vec();
        dates.sort_unstable();
        dates.dedup();
        CacheKey::Bulk {
            dates,
            service_id,
            duration_minutes,
        }
    }

    pub fn day(date: NaiveDate, service_id: Option<Ulid>, duration_minutes: u32) -> Self {
        CacheKey::Day {
            date,
            service_id,
            duration_minutes,
        }
    }

    /// Deterministic string form: fields are emitted in sorted name order.
    pub fn fingerprint(&self) -> String {
        let mut fields: BTreeMap<&'static str, String> = BTreeMap::new();
        let kind = match self {
            CacheKey::Slots {
                date,
                service_id,
                duration_minutes,
                exclude_booking_id,
            } => {
                fields.insert("date", date.to_string());
                fields.insert("service", id_or_any(service_id));
                fields.insert("duration", hours_from_minutes(*duration_minutes).to_string());
                fields.insert("exclude", id_or_any(exclude_booking_id));
                "slots"
            }
            CacheKey::Bulk {
                dates,
                service_id,
                duration_minutes,
            } => {
                let joined: Vec<String> = dates.iter().map(NaiveDate::to_string).collect();
                fields.insert("dates", joined.join(","));
                fields.insert("service", id_or_any(service_id));
                fields.insert("duration", hours_from_minutes(*duration_minutes).to_string());
                "bulk"
            }
            CacheKey::Day {
                date,
                service_id,
                duration_minutes,
            } => {
                fields.insert("date", date.to_string());
                fields.insert("service", id_or_any(service_id));
                fields.insert("duration", hours_from_minutes(*duration_minutes).to_string());
                "day"
            }
        };
        let parts: Vec<String> = fields.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{kind}:{}", parts.join("&"))
    }

    fn service_id(&self) -> Option<Ulid> {
        match self {
            CacheKey::Slots { service_id, .. }
            | CacheKey::Bulk { service_id, .. }
            | CacheKey::Day { service_id, .. } => *service_id,
        }
    }

    /// First and last date this answer depends on.
    fn date_range(&self) -> (NaiveDate, NaiveDate) {
        match self {
            CacheKey::Slots { date, .. } | CacheKey::Day { date, .. } => (*date, *date),
            CacheKey::Bulk { dates, .. } => match (dates.first(), dates.last()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => (NaiveDate::MIN, NaiveDate::MAX),
            },
        }
    }
}

fn id_or_any(id: &Option<Ulid>) -> String {
    id.map_or_else(|| "*".to_string(), |id| id.to_string())
}

/// What a cache entry holds. Consumers match on the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum CachePayload {
    Slots(Arc<AvailabilityResult>),
    Bulk(Arc<Vec<DateAvailability>>),
    Day(DateAvailability),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: CachePayload,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Process-wide, time-windowed availability cache.
///
/// One `Mutex` guards the whole key space: every `get`/`set`/`delete` and
/// every sweep or invalidation is serialized through it, so an entry is never
/// observed half-written. Entries are immutable once stored; invalidation
/// deletes and a later query recomputes. A result computed across an
/// invalidation is stale, so computed writes go through
/// [`set_since`](AvailabilityCache::set_since) and are dropped when the
/// invalidation epoch moved while they were computing.
///
/// Expiry reads tokio's clock, so tests drive it with a paused runtime.
pub struct AvailabilityCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
    /// Bumped under the entries lock by every invalidation and clear.
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl AvailabilityCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// A panic while holding the lock cannot leave an entry half-written
    /// (inserts are single `HashMap` operations), so recover the guard.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expired entries count as misses and are dropped on the spot.
    pub fn get(&self, key: &CacheKey) -> Option<CachePayload> {
        let fingerprint = key.fingerprint();
        let now = Instant::now();
        let mut entries = self.lock();
        let expired = match entries.get(&fingerprint) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(CACHE_HITS_TOTAL).increment(1);
                return Some(entry.payload.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(&fingerprint);
            metrics::counter!(CACHE_EVICTIONS_TOTAL, "reason" => "expired").increment(1);
            metrics::gauge!(CACHE_ENTRIES).set(entries.len() as f64);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(CACHE_MISSES_TOTAL).increment(1);
        None
    }

    pub fn get_slots(&self, key: &CacheKey) -> Option<Arc<AvailabilityResult>> {
        match self.get(key)? {
            CachePayload::Slots(result) => Some(result),
            _ => None,
        }
    }

    pub fn get_bulk(&self, key: &CacheKey) -> Option<Arc<Vec<DateAvailability>>> {
        match self.get(key)? {
            CachePayload::Bulk(days) => Some(days),
            _ => None,
        }
    }

    pub fn get_day(&self, key: &CacheKey) -> Option<DateAvailability> {
        match self.get(key)? {
            CachePayload::Day(day) => Some(day),
            _ => None,
        }
    }

    fn entry(&self, key: CacheKey, payload: CachePayload, ttl: Option<Duration>) -> CacheEntry {
        let now = Instant::now();
        CacheEntry {
            key,
            payload,
            created_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
        }
    }

    /// Store `payload` under `key` for `ttl` (the cache default when `None`).
    pub fn set(&self, key: CacheKey, payload: CachePayload, ttl: Option<Duration>) {
        let entry = self.entry(key, payload, ttl);
        let mut entries = self.lock();
        entries.insert(entry.key.fingerprint(), entry);
        metrics::gauge!(CACHE_ENTRIES).set(entries.len() as f64);
    }

    /// Invalidation epoch. Read it before fetching the data a result is
    /// computed from.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Like [`set`](AvailabilityCache::set), unless an invalidation or clear
    /// happened after `epoch` was read. Returns whether the entry was stored.
    pub fn set_since(
        &self,
        epoch: u64,
        key: CacheKey,
        payload: CachePayload,
        ttl: Option<Duration>,
    ) -> bool {
        let entry = self.entry(key, payload, ttl);
        let mut entries = self.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!("dropping {} computed across an invalidation", entry.key.fingerprint());
            return false;
        }
        entries.insert(entry.key.fingerprint(), entry);
        metrics::gauge!(CACHE_ENTRIES).set(entries.len() as f64);
        true
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        let mut entries = self.lock();
        let removed = entries.remove(&key.fingerprint()).is_some();
        metrics::gauge!(CACHE_ENTRIES).set(entries.len() as f64);
        removed
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let n = entries.len();
        entries.clear();
        metrics::counter!(CACHE_EVICTIONS_TOTAL, "reason" => "cleared").increment(n as u64);
        metrics::gauge!(CACHE_ENTRIES).set(0.0);
        n
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            metrics::counter!(CACHE_EVICTIONS_TOTAL, "reason" => "expired").increment(removed as u64);
        }
        metrics::gauge!(CACHE_ENTRIES).set(entries.len() as f64);
        removed
    }

    /// Delete every entry whose answer `scope` may have changed.
    pub fn invalidate(&self, scope: &Scope) -> usize {
        if *scope == Scope::All {
            return self.clear();
        }
        let mut entries = self.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|_, e| {
            let (first, last) = e.key.date_range();
            !scope.covers(first, last, e.key.service_id())
        });
        let removed = before - entries.len();
        metrics::counter!(CACHE_EVICTIONS_TOTAL, "reason" => "invalidated").increment(removed as u64);
        metrics::gauge!(CACHE_ENTRIES).set(entries.len() as f64);
        debug!("cache invalidation {scope:?} removed {removed} entries");
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current fingerprints, sorted. Debug visibility only.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Invalidator for AvailabilityCache {
    fn invalidate(&self, scope: &Scope) -> Result<(), InvalidatorError> {
        AvailabilityCache::invalidate(self, scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn result_for(date: NaiveDate) -> Arc<AvailabilityResult> {
        Arc::new(AvailabilityResult {
            date,
            service_id: None,
            duration: 2.0,
            slots: Vec::new(),
            summary: Summary::of(&[]),
            service_info: None,
        })
    }

    fn slots_key(date: NaiveDate, service: Option<Ulid>) -> CacheKey {
        CacheKey::Slots {
            date,
            service_id: service,
            duration_minutes: 120,
            exclude_booking_id: None,
        }
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let svc = Ulid::new();
        let a = CacheKey::bulk(&[d(12), d(10), d(11)], Some(svc), 120);
        let b = CacheKey::bulk(&[d(10), d(11), d(12), d(11)], Some(svc), 120);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let q1 = AvailabilityQuery::new(d(10), 90).for_service(svc);
        let q2 = AvailabilityQuery {
            exclude_booking_id: None,
            duration_minutes: 90,
            service_id: Some(svc),
            date: d(10),
        };
        assert_eq!(CacheKey::slots(&q1).fingerprint(), CacheKey::slots(&q2).fingerprint());
        assert_eq!(
            CacheKey::slots(&q1).fingerprint(),
            format!("slots:date=2024-06-10&duration=1.5&exclude=*&service={svc}")
        );
    }

    #[test]
    fn fingerprints_distinguish_kinds_and_exclusions() {
        let key = slots_key(d(10), None);
        let day = CacheKey::day(d(10), None, 120);
        let excl = CacheKey::slots(&AvailabilityQuery::new(d(10), 120).excluding(Ulid::new()));
        assert_ne!(key.fingerprint(), day.fingerprint());
        assert_ne!(key.fingerprint(), excl.fingerprint());
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_then_expire() {
        let cache = AvailabilityCache::new(Duration::from_secs(300));
        let key = slots_key(d(10), None);
        let value = result_for(d(10));
        cache.set(key.clone(), CachePayload::Slots(value.clone()), None);

        assert_eq!(cache.get_slots(&key), Some(value));

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(cache.get(&key).is_some(), "still valid at the expiry instant");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get(&key).is_none());
        // Lazy deletion on read.
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_ttl() {
        let cache = AvailabilityCache::default();
        let short = slots_key(d(10), None);
        let long = slots_key(d(11), None);
        cache.set(short.clone(), CachePayload::Slots(result_for(d(10))), Some(Duration::from_secs(5)));
        cache.set(long.clone(), CachePayload::Slots(result_for(d(11))), None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&short).is_none());
        assert!(cache.get(&long).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let cache = AvailabilityCache::new(Duration::from_secs(60));
        cache.set(slots_key(d(10), None), CachePayload::Slots(result_for(d(10))), None);
        cache.set(
            slots_key(d(11), None),
            CachePayload::Slots(result_for(d(11))),
            Some(Duration::from_secs(600)),
        );
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep_expired(), 0);
    }

    #[test]
    fn typed_getters_match_tags() {
        let cache = AvailabilityCache::default();
        let key = CacheKey::day(d(10), None, 60);
        let day = DateAvailability::from_summary(d(10), &Summary::of(&[]));
        cache.set(key.clone(), CachePayload::Day(day.clone()), None);
        assert_eq!(cache.get_day(&key), Some(day));
        assert!(cache.get_slots(&key).is_none());
    }

    #[test]
    fn delete_and_clear() {
        let cache = AvailabilityCache::default();
        let a = slots_key(d(10), None);
        cache.set(a.clone(), CachePayload::Slots(result_for(d(10))), None);
        cache.set(slots_key(d(11), None), CachePayload::Slots(result_for(d(11))), None);
        assert!(cache.delete(&a));
        assert!(!cache.delete(&a));
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_targets_affected_entries() {
        let cache = AvailabilityCache::default();
        let svc = Ulid::new();
        let other = Ulid::new();
        let empty = Arc::new(Vec::new());

        cache.set(slots_key(d(10), Some(svc)), CachePayload::Slots(result_for(d(10))), None);
        cache.set(slots_key(d(11), Some(svc)), CachePayload::Slots(result_for(d(11))), None);
        cache.set(slots_key(d(10), Some(other)), CachePayload::Slots(result_for(d(10))), None);
        cache.set(slots_key(d(10), None), CachePayload::Slots(result_for(d(10))), None);
        cache.set(
            CacheKey::bulk(&[d(8), d(12)], Some(svc), 120),
            CachePayload::Bulk(empty.clone()),
            None,
        );
        cache.set(
            CacheKey::bulk(&[d(12), d(13)], Some(svc), 120),
            CachePayload::Bulk(empty),
            None,
        );

        let scope = Scope::Dates { start: d(10), end: d(10), service_id: Some(svc) };
        // Own slots key, service-less key, and the bulk range containing the 10th.
        assert_eq!(cache.invalidate(&scope), 3);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&slots_key(d(11), Some(svc))).is_some());
        assert!(cache.get(&slots_key(d(10), Some(other))).is_some());

        // Idempotent.
        assert_eq!(cache.invalidate(&scope), 0);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = AvailabilityCache::default();
        let key = slots_key(d(10), None);
        assert!(cache.get(&key).is_none());
        cache.set(key.clone(), CachePayload::Slots(result_for(d(10))), None);
        assert!(cache.get(&key).is_some());
        let stats = cache.stats();
        assert_eq!(stats, CacheStats { entries: 1, hits: 1, misses: 1 });
        assert_eq!(cache.keys(), vec![key.fingerprint()]);
    }

    #[test]
    fn result_computed_across_invalidation_is_dropped() {
        let cache = AvailabilityCache::default();
        let key = slots_key(d(10), None);

        let before = cache.epoch();
        cache.invalidate(&Scope::Dates { start: d(12), end: d(12), service_id: None });
        assert!(!cache.set_since(before, key.clone(), CachePayload::Slots(result_for(d(10))), None));
        assert!(cache.is_empty());

        let now = cache.epoch();
        assert!(cache.set_since(now, key.clone(), CachePayload::Slots(result_for(d(10))), None));
        assert!(cache.get(&key).is_some());
    }
}
