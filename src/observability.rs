use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "slotbook_operations_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "slotbook_operation_duration_seconds";

/// Counter: slot writes rejected by the store's version check.
pub const CAS_CONFLICTS_TOTAL: &str = "slotbook_cas_conflicts_total";

/// Counter: capacity claims rolled back after the reservation write failed.
pub const COMPENSATIONS_TOTAL: &str = "slotbook_compensations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

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

/// Short outcome label for an engine result.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::SlotNotFound(_)) => "slot_not_found",
        Err(EngineError::ReservationNotFound(_)) => "reservation_not_found",
        Err(EngineError::SlotFull { .. }) => "slot_full",
        Err(EngineError::DuplicateBooking { .. }) => "duplicate_booking",
        Err(EngineError::AlreadyCancelled { .. }) => "already_cancelled",
        Err(EngineError::Timeout) => "timeout",
        Err(EngineError::Contention { .. }) => "contention",
        Err(EngineError::StoreUnavailable(_)) => "store_unavailable",
        Err(EngineError::InvalidUser) => "invalid_user",
        Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
    }
}

/// Record the outcome and latency of one engine operation.
pub fn record_operation<T>(
    op: &'static str,
    started: std::time::Instant,
    result: &Result<T, EngineError>,
) {
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "outcome" => outcome_label(result))
        .increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
