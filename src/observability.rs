use std::net::SocketAddr;

use crate::sql::Command;

// Request-driven (RED) metrics.

/// Counter, labels command/status: queries executed.
pub const QUERIES_TOTAL: &str = "lessond_queries_total";

/// Histogram, label command: query latency in seconds.
pub const QUERY_DURATION_SECONDS: &str = "lessond_query_duration_seconds";

// Resource (USE) metrics.

/// Gauge: TCP connections currently open.
pub const CONNECTIONS_ACTIVE: &str = "lessond_connections_active";

/// Counter: connections accepted over the process lifetime.
pub const CONNECTIONS_TOTAL: &str = "lessond_connections_total";

/// Counter: connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lessond_connections_rejected_total";

/// Gauge: studios with a loaded engine.
pub const STUDIOS_ACTIVE: &str = "lessond_studios_active";

/// Histogram: seconds per WAL group-commit flush.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessond_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessond_wal_flush_batch_size";

/// Start the Prometheus exporter, if a port was configured.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Short per-command label for the query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertLesson { .. } => "insert_lesson",
        Command::UpdateLesson { .. } => "update_lesson",
        Command::UpdateLessonStatus { .. } => "update_lesson_status",
        Command::DeleteLesson { .. } => "delete_lesson",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::MarkAttendance { .. } => "mark_attendance",
        Command::Rollover { .. } => "rollover",
        Command::SelectLessons { .. } => "select_lessons",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectStats => "select_stats",
    }
}
