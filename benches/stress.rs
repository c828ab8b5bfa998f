use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use availd::cache::AvailabilityCache;
use availd::engine::Engine;
use availd::invalidation::InvalidationBus;
use availd::model::{AvailabilityQuery, BookingRecord, BookingStatus, Schedule, ServiceRecord};
use availd::source::InMemoryStore;

const DAYS: u64 = 60;
const BOOKINGS_PER_DAY: u32 = 8;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn first_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
}

fn day(offset: u64) -> NaiveDate {
    first_day().checked_add_days(Days::new(offset)).unwrap()
}

struct Fixture {
    engine: Arc<Engine>,
    store: Arc<InMemoryStore>,
    service: Ulid,
}

fn setup() -> Fixture {
    let bus = Arc::new(InvalidationBus::new());
    let store = Arc::new(InMemoryStore::new(bus.clone()));
    let engine = Arc::new(Engine::new(
        Schedule::default(),
        Arc::new(AvailabilityCache::default()),
        bus,
        store.clone(),
        store.clone(),
    ));
    let service = Ulid::new();
    store.upsert_service(ServiceRecord {
        id: service,
        name: "Hedge trimming".into(),
        base_price: 60.0,
        price_per_hour: 40.0,
    });

    let start = Instant::now();
    for offset in 0..DAYS {
        for i in 0..BOOKINGS_PER_DAY {
            let hour = 8 + i;
            store
                .upsert_booking(BookingRecord {
                    id: Ulid::new(),
                    service_id: service,
                    date: day(offset),
                    start: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(hour, 45, 0).unwrap(),
                    status: BookingStatus::Confirmed,
                })
                .unwrap();
        }
    }
    println!(
        "  {} bookings over {DAYS} days in {:.2}ms",
        store.booking_count(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Fixture { engine, store, service }
}

fn query(f: &Fixture, offset: u64) -> AvailabilityQuery {
    let mut q = AvailabilityQuery::new(day(offset), 90);
    q.service_id = Some(f.service);
    q
}

async fn phase1_cold_vs_warm(f: &Fixture) {
    let mut cold = Vec::new();
    let mut warm = Vec::new();
    for offset in 0..DAYS {
        let q = query(f, offset);
        let t = Instant::now();
        f.engine.get_availability(&q).await.unwrap();
        cold.push(t.elapsed());

        let t = Instant::now();
        f.engine.get_availability(&q).await.unwrap();
        warm.push(t.elapsed());
    }
    print_latency("miss (compute)", &mut cold);
    print_latency("hit (cache)", &mut warm);
}

async fn phase2_bulk(f: &Fixture) {
    let dates: Vec<NaiveDate> = (0..31).map(day).collect();
    f.engine.cache().clear();

    let mut cold = Vec::new();
    let mut warm = Vec::new();
    for _ in 0..20 {
        f.engine.cache().clear();
        let t = Instant::now();
        f.engine
            .get_bulk_availability(&dates, Some(f.service), 90)
            .await
            .unwrap();
        cold.push(t.elapsed());

        let t = Instant::now();
        f.engine
            .get_bulk_availability(&dates, Some(f.service), 90)
            .await
            .unwrap();
        warm.push(t.elapsed());
    }
    print_latency("31-day bulk, cold", &mut cold);
    print_latency("31-day bulk, cached", &mut warm);
}

async fn phase3_read_under_invalidation(f: &Fixture) {
    let n_readers = 8;
    let n_reads = 500;

    // Writer keeps moving one booking around the first week.
    let writer = {
        let store = f.store.clone();
        let service = f.service;
        tokio::spawn(async move {
            let id = Ulid::new();
            let mut writes = 0u32;
            for i in 0..2_000u64 {
                let _ = store.upsert_booking(BookingRecord {
                    id,
                    service_id: service,
                    date: day(i % 7),
                    start: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                    status: BookingStatus::Confirmed,
                });
                writes += 1;
                tokio::task::yield_now().await;
            }
            writes
        })
    };

    let start = Instant::now();
    let mut handles = Vec::new();
    for r in 0..n_readers {
        let engine = f.engine.clone();
        let q = query(f, r % 7);
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_reads);
            for _ in 0..n_reads {
                let t = Instant::now();
                engine.get_availability(&q).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }
    let writes = writer.await.unwrap();
    println!(
        "  {n_readers} readers x {n_reads} reads alongside {writes} writes in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("read latency", &mut latencies);
    let stats = f.engine.cache_stats();
    println!("  cache: hits={}, misses={}", stats.hits, stats.misses);
}

async fn phase4_preload(f: &Fixture) {
    f.engine.cache().clear();
    let today = first_day().pred_opt().unwrap();
    let start = Instant::now();
    let report = f.engine.preload(Some(f.service), 90, 30, today).await;
    println!(
        "  preload 30 days: populated={}, failed={} in {:.2}ms",
        report.populated,
        report.failed,
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== availd engine benchmark ===\n");

    println!("[setup]");
    let fixture = setup();

    println!("\n[phase 1] single-date availability");
    phase1_cold_vs_warm(&fixture).await;

    println!("\n[phase 2] bulk availability");
    phase2_bulk(&fixture).await;

    println!("\n[phase 3] read latency under invalidation");
    phase3_read_under_invalidation(&fixture).await;

    println!("\n[phase 4] preload");
    phase4_preload(&fixture).await;

    println!("\n=== benchmark complete ===");
}
