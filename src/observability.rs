use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total slot queries served.
pub const SLOT_QUERIES_TOTAL: &str = "lessonslot_slot_queries_total";

/// Histogram: slot query latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "lessonslot_slot_query_duration_seconds";

/// Counter: booking groups committed.
pub const BOOKINGS_TOTAL: &str = "lessonslot_bookings_total";

/// Counter: submissions refused because a selection was no longer free.
pub const BOOKING_CONFLICTS_TOTAL: &str = "lessonslot_booking_conflicts_total";

/// Counter: payment captures that failed and triggered a release.
pub const PAYMENT_FAILURES_TOTAL: &str = "lessonslot_payment_failures_total";

/// Counter: waitlist entries promoted into reservations.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "lessonslot_waitlist_promotions_total";

/// Counter: reservations released (payment failure or capture deadline).
pub const RESERVATIONS_RELEASED_TOTAL: &str = "lessonslot_reservations_released_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: registered teachers.
pub const TEACHERS_ACTIVE: &str = "lessonslot_teachers_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessonslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessonslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
