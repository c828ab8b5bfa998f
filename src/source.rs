use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tracing::debug;
use ulid::Ulid;

use crate::invalidation::InvalidationBus;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The backing store could not be reached or queried.
    Unavailable(String),
    NotFound(Ulid),
    Invalid(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            SourceError::NotFound(id) => write!(f, "not found: {id}"),
            SourceError::Invalid(msg) => write!(f, "invalid: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Read side of the booking store.
#[async_trait]
pub trait BookingSource: Send + Sync {
    /// Non-cancelled bookings on `date`, for one service or all, minus `exclude`.
    async fn bookings_on(
        &self,
        date: NaiveDate,
        service_id: Option<Ulid>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<BookingRecord>, SourceError>;

    /// Non-cancelled bookings on every date in `start..=end`, in one round trip.
    async fn bookings_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        service_id: Option<Ulid>,
    ) -> Result<Vec<BookingRecord>, SourceError>;
}

#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn service(&self, id: Ulid) -> Result<Option<ServiceRecord>, SourceError>;
}

// ── In-memory store ──────────────────────────────────────────────

/// Reference booking store. It is also the mutation side: every write commits
/// to the indexes first and only then publishes on the invalidation bus.
/// Writers are serialized so a booking is never indexed under two dates.
pub struct InMemoryStore {
    /// Bookings per date, sorted by `start`.
    days: DashMap<NaiveDate, Vec<BookingRecord>>,
    /// Reverse lookup: booking id → date.
    booking_to_date: DashMap<Ulid, NaiveDate>,
    services: DashMap<Ulid, ServiceRecord>,
    /// Held across the remove-then-insert of a booking write.
    writes: Mutex<()>,
    bus: Arc<InvalidationBus>,
}

impl InMemoryStore {
    pub fn new(bus: Arc<InvalidationBus>) -> Self {
        Self {
            days: DashMap::new(),
            booking_to_date: DashMap::new(),
            services: DashMap::new(),
            writes: Mutex::new(()),
            bus,
        }
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_date.len()
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<BookingRecord> {
        let date = *self.booking_to_date.get(id)?;
        self.days
            .get(&date)
            .and_then(|day| day.iter().find(|b| b.id == *id).cloned())
    }

    // ── Services ─────────────────────────────────────────────

    pub fn upsert_service(&self, service: ServiceRecord) {
        let id = service.id;
        self.services.insert(id, service);
        // Cached results carry a pricing snapshot.
        self.bus.invalidate(None, Some(id));
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Create, reschedule, or change the status of a booking, keyed by id.
    /// Returns the previous version if one existed.
    pub fn upsert_booking(&self, booking: BookingRecord) -> Result<Option<BookingRecord>, SourceError> {
        if booking.start >= booking.end {
            return Err(SourceError::Invalid(format!(
                "booking {} ends before it starts",
                booking.id
            )));
        }
        if !self.services.is_empty() && !self.services.contains_key(&booking.service_id) {
            return Err(SourceError::NotFound(booking.service_id));
        }

        let (date, service_id) = (booking.date, booking.service_id);
        let previous = {
            let _writing = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = self.remove_indexed(&booking.id);
            self.insert_indexed(booking);
            previous
        };
        debug!("booking upserted on {date}");

        // Committed; now tell readers.
        if let Some(prev) = &previous
            && (prev.date != date || prev.service_id != service_id)
        {
            self.bus.invalidate(Some(prev.date), Some(prev.service_id));
        }
        self.bus.invalidate(Some(date), Some(service_id));
        Ok(previous)
    }

    pub fn set_status(&self, id: Ulid, status: BookingStatus) -> Result<BookingRecord, SourceError> {
        let updated = {
            let _writing = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
            let date = *self
                .booking_to_date
                .get(&id)
                .ok_or(SourceError::NotFound(id))?;
            let mut day = self.days.get_mut(&date).ok_or(SourceError::NotFound(id))?;
            let booking = day
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or(SourceError::NotFound(id))?;
            booking.status = status;
            booking.clone()
        };
        self.bus.invalidate(Some(updated.date), Some(updated.service_id));
        Ok(updated)
    }

    pub fn cancel_booking(&self, id: Ulid) -> Result<BookingRecord, SourceError> {
        self.set_status(id, BookingStatus::Cancelled)
    }

    /// Insert maintaining sort order by start.
    fn insert_indexed(&self, booking: BookingRecord) {
        let (id, date) = (booking.id, booking.date);
        {
            let mut day = self.days.entry(date).or_default();
            let pos = day
                .binary_search_by_key(&booking.start, |b| b.start)
                .unwrap_or_else(|e| e);
            day.insert(pos, booking);
        }
        self.booking_to_date.insert(id, date);
    }

    fn remove_indexed(&self, id: &Ulid) -> Option<BookingRecord> {
        let (_, date) = self.booking_to_date.remove(id)?;
        let mut day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == *id)?;
        Some(day.remove(pos))
    }

    fn collect_day(
        &self,
        date: NaiveDate,
        service_id: Option<Ulid>,
        exclude: Option<Ulid>,
        out: &mut Vec<BookingRecord>,
    ) {
        if let Some(day) = self.days.get(&date) {
            out.extend(
                day.iter()
                    .filter(|b| b.status.blocks())
                    .filter(|b| service_id.is_none_or(|s| s == b.service_id))
                    .filter(|b| exclude != Some(b.id))
                    .cloned(),
            );
        }
    }
}

#[async_trait]
impl BookingSource for InMemoryStore {
    async fn bookings_on(
        &self,
        date: NaiveDate,
        service_id: Option<Ulid>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<BookingRecord>, SourceError> {
        let mut out = Vec::new();
        self.collect_day(date, service_id, exclude, &mut out);
        Ok(out)
    }

    async fn bookings_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        service_id: Option<Ulid>,
    ) -> Result<Vec<BookingRecord>, SourceError> {
        if end < start {
            return Err(SourceError::Invalid(format!("empty range {start}..={end}")));
        }
        let mut out = Vec::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            self.collect_day(date, service_id, None, &mut out);
        }
        Ok(out)
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryStore {
    async fn service(&self, id: Ulid) -> Result<Option<ServiceRecord>, SourceError> {
        Ok(self.services.get(&id).map(|s| s.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::NaiveTime;

    use super::*;
    use crate::invalidation::{Invalidator, InvalidatorError, Scope};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Scope>>,
    }

    impl Invalidator for Recorder {
        fn invalidate(&self, scope: &Scope) -> Result<(), InvalidatorError> {
            self.seen.lock().unwrap().push(*scope);
            Ok(())
        }
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn setup() -> (InMemoryStore, Arc<Recorder>, Ulid) {
        let bus = Arc::new(InvalidationBus::new());
        let rec = Arc::new(Recorder::default());
        bus.register(rec.clone()).unwrap();
        let store = InMemoryStore::new(bus);
        let svc = Ulid::new();
        store.upsert_service(ServiceRecord {
            id: svc,
            name: "Gutter cleaning".into(),
            base_price: 80.0,
            price_per_hour: 45.0,
        });
        rec.seen.lock().unwrap().clear();
        (store, rec, svc)
    }

    fn booking(svc: Ulid, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> BookingRecord {
        BookingRecord {
            id: Ulid::new(),
            service_id: svc,
            date,
            start,
            end,
            status: BookingStatus::Confirmed,
        }
    }

    #[tokio::test]
    async fn bookings_kept_sorted_per_day() {
        let (store, _, svc) = setup();
        store.upsert_booking(booking(svc, d(10), t(14, 0), t(15, 0))).unwrap();
        store.upsert_booking(booking(svc, d(10), t(9, 0), t(10, 0))).unwrap();
        store.upsert_booking(booking(svc, d(11), t(9, 0), t(10, 0))).unwrap();

        let day = store.bookings_on(d(10), Some(svc), None).await.unwrap();
        assert_eq!(day.len(), 2);
        assert!(day[0].start < day[1].start);
        assert_eq!(store.booking_count(), 3);
    }

    #[tokio::test]
    async fn create_invalidates_after_commit() {
        let (store, rec, svc) = setup();
        store.upsert_booking(booking(svc, d(10), t(9, 0), t(10, 0))).unwrap();
        assert_eq!(
            *rec.seen.lock().unwrap(),
            vec![Scope::Dates { start: d(10), end: d(10), service_id: Some(svc) }]
        );
    }

    #[tokio::test]
    async fn reschedule_invalidates_both_dates() {
        let (store, rec, svc) = setup();
        let mut b = booking(svc, d(10), t(9, 0), t(10, 0));
        store.upsert_booking(b.clone()).unwrap();
        rec.seen.lock().unwrap().clear();

        b.date = d(12);
        let prev = store.upsert_booking(b.clone()).unwrap();
        assert_eq!(prev.map(|p| p.date), Some(d(10)));

        let seen = rec.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].covers(d(10), d(10), Some(svc)));
        assert!(seen[1].covers(d(12), d(12), Some(svc)));
        drop(seen);

        assert!(store.bookings_on(d(10), None, None).await.unwrap().is_empty());
        assert_eq!(store.bookings_on(d(12), None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_bookings_are_not_returned() {
        let (store, rec, svc) = setup();
        let b = booking(svc, d(10), t(9, 0), t(10, 0));
        store.upsert_booking(b.clone()).unwrap();
        rec.seen.lock().unwrap().clear();

        let cancelled = store.cancel_booking(b.id).unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(rec.seen.lock().unwrap().len(), 1);
        assert!(store.bookings_on(d(10), Some(svc), None).await.unwrap().is_empty());
        assert_eq!(store.get_booking(&b.id).map(|b| b.status), Some(BookingStatus::Cancelled));
    }

    #[tokio::test]
    async fn exclusion_and_service_filters() {
        let (store, _, svc) = setup();
        let other = Ulid::new();
        store.upsert_service(ServiceRecord {
            id: other,
            name: "Window washing".into(),
            base_price: 50.0,
            price_per_hour: 30.0,
        });
        let mine = booking(svc, d(10), t(9, 0), t(10, 0));
        let theirs = booking(other, d(10), t(11, 0), t(12, 0));
        store.upsert_booking(mine.clone()).unwrap();
        store.upsert_booking(theirs).unwrap();

        assert_eq!(store.bookings_on(d(10), None, None).await.unwrap().len(), 2);
        assert_eq!(store.bookings_on(d(10), Some(svc), None).await.unwrap().len(), 1);
        assert!(store.bookings_on(d(10), Some(svc), Some(mine.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batched_range_query() {
        let (store, _, svc) = setup();
        for day in 10..15 {
            store.upsert_booking(booking(svc, d(day), t(9, 0), t(10, 0))).unwrap();
        }
        let all = store.bookings_between(d(11), d(13), Some(svc)).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(store.bookings_between(d(13), d(11), None).await.is_err());
    }

    #[test]
    fn concurrent_reschedules_keep_one_copy() {
        let (store, _, svc) = setup();
        let b = booking(svc, d(10), t(9, 0), t(10, 0));
        store.upsert_booking(b.clone()).unwrap();

        std::thread::scope(|scope| {
            for writer in 0..4u32 {
                let (store, mut b) = (&store, b.clone());
                scope.spawn(move || {
                    for i in 0..50u32 {
                        b.date = d(10 + (writer + i) % 3);
                        store.upsert_booking(b.clone()).unwrap();
                    }
                });
            }
        });

        let copies: usize = store
            .days
            .iter()
            .map(|day| day.iter().filter(|x| x.id == b.id).count())
            .sum();
        assert_eq!(copies, 1);
        assert_eq!(store.booking_count(), 1);
        let date = *store.booking_to_date.get(&b.id).unwrap();
        assert_eq!(store.get_booking(&b.id).map(|x| x.date), Some(date));
    }

    #[tokio::test]
    async fn rejects_bad_bookings() {
        let (store, _, svc) = setup();
        let backwards = booking(svc, d(10), t(10, 0), t(9, 0));
        assert!(matches!(store.upsert_booking(backwards), Err(SourceError::Invalid(_))));
        let unknown = booking(Ulid::new(), d(10), t(9, 0), t(10, 0));
        assert!(matches!(store.upsert_booking(unknown), Err(SourceError::NotFound(_))));
        assert!(matches!(store.set_status(Ulid::new(), BookingStatus::Confirmed), Err(SourceError::NotFound(_))));
    }
}
