use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: coordinator runs. Labels: op, outcome.
pub const BOOKINGS_TOTAL: &str = "classbook_bookings_total";

/// Histogram: coordinator run latency in seconds. Labels: op.
pub const BOOKING_DURATION_SECONDS: &str = "classbook_booking_duration_seconds";

/// Counter: conflicts detected. Labels: field.
pub const CONFLICTS_TOTAL: &str = "classbook_conflicts_total";

/// Histogram: sessions produced per rule expansion.
pub const SESSIONS_GENERATED: &str = "classbook_sessions_generated";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting for resource locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "classbook_lock_wait_seconds";

/// Counter: lock acquisitions that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "classbook_lock_timeouts_total";

/// Gauge: series currently stored.
pub const SERIES_ACTIVE: &str = "classbook_series_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "classbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "classbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
