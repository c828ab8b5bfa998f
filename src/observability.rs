use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "availd_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "availd_query_duration_seconds";

/// Counter: availability queries dropped because a newer one replaced them.
pub const QUERIES_SUPERSEDED_TOTAL: &str = "availd_queries_superseded_total";

// ── Cache ───────────────────────────────────────────────────────

pub const CACHE_HITS_TOTAL: &str = "availd_cache_hits_total";

pub const CACHE_MISSES_TOTAL: &str = "availd_cache_misses_total";

/// Gauge: live cache entries.
pub const CACHE_ENTRIES: &str = "availd_cache_entries";

/// Counter: entries removed. Labels: reason (expired, invalidated, cleared, deleted).
pub const CACHE_EVICTIONS_TOTAL: &str = "availd_cache_evictions_total";

// ── Invalidation & preload ──────────────────────────────────────

pub const INVALIDATIONS_TOTAL: &str = "availd_invalidations_total";

pub const INVALIDATOR_FAILURES_TOTAL: &str = "availd_invalidator_failures_total";

/// Counter: dates the preloader could not populate.
pub const PRELOAD_FAILURES_TOTAL: &str = "availd_preload_failures_total";

/// Histogram: wall time of one preload run in seconds.
pub const PRELOAD_DURATION_SECONDS: &str = "availd_preload_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "availd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "availd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "availd_connections_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectNextAvailable { .. } => "select_next_available",
        Command::SelectBulk { .. } => "select_bulk_availability",
        Command::SelectPreload { .. } => "select_preload",
        Command::SelectCacheStats => "select_cache_stats",
        Command::SelectCacheKeys => "select_cache_keys",
        Command::InsertService(_) => "insert_service",
        Command::InsertBookings(_) => "insert_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::DeleteCache { .. } => "delete_cache",
        Command::Listen => "listen",
        Command::Unlisten => "unlisten",
    }
}
