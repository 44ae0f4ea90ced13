use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "timetabled_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "timetabled_query_duration_seconds";

/// Counter: bookings admitted. Labels: op.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "timetabled_bookings_admitted_total";

/// Counter: bookings rejected. Labels: op, reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "timetabled_bookings_rejected_total";

/// Histogram: end-to-end admission latency in seconds. Labels: op.
pub const ADMISSION_DURATION_SECONDS: &str = "timetabled_admission_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "timetabled_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "timetabled_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "timetabled_connections_rejected_total";

/// Histogram: time spent waiting for resource locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "timetabled_lock_wait_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "timetabled_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "timetabled_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectWeekdays => "select_weekdays",
        Command::SelectClassKinds => "select_class_kinds",
    }
}
