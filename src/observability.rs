use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: admission attempts. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "slotgate_admissions_total";

/// Histogram: end-to-end admission latency in seconds.
pub const ADMISSION_DURATION_SECONDS: &str = "slotgate_admission_duration_seconds";

/// Histogram: time spent waiting for a host lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotgate_lock_wait_seconds";

/// Counter: slot queries served on the read path.
pub const SLOT_QUERIES_TOTAL: &str = "slotgate_slot_queries_total";

// ── Collaborators ───────────────────────────────────────────────

/// Counter: bookings that fell back to the placeholder location.
pub const CONFERENCING_FALLBACKS_TOTAL: &str = "slotgate_conferencing_fallbacks_total";

/// Counter: notifier calls that failed after commit.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "slotgate_notification_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: hosts loaded in the engine.
pub const HOSTS_ACTIVE: &str = "slotgate_hosts_active";

/// Counter: bookings moved to completed by the sweeper.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "slotgate_bookings_completed_total";

/// Counter: bookings and links dropped by the retention sweep.
pub const HISTORY_PURGED_TOTAL: &str = "slotgate_history_purged_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotgate_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotgate_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map an admission result to a short label for metrics.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(e) => e.label(),
    }
}
