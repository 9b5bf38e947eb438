use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "visitd_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "visitd_request_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (admitted, conflict, invalid, not_found, unavailable).
pub const VISITS_SUBMITTED_TOTAL: &str = "visitd_visits_submitted_total";

/// Counter: rejected booking attempts. Labels: rule.
pub const CONFLICTS_TOTAL: &str = "visitd_conflicts_total";

/// Counter: vendor/admin decisions. Labels: status.
pub const DECISIONS_TOTAL: &str = "visitd_decisions_total";

/// Counter: requests refused by the rate limiter.
pub const RATE_LIMITED_TOTAL: &str = "visitd_rate_limited_total";

/// Gauge: keys tracked by the rate limiter.
pub const RATE_LIMIT_KEYS: &str = "visitd_rate_limit_keys";

/// Counter: notifications or chats that could not be delivered. Labels: kind.
pub const DISPATCH_FAILURES_TOTAL: &str = "visitd_dispatch_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "visitd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "visitd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "visitd_wal_compactions_total";

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

/// Map a submission result to a short outcome label for metrics.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::InvalidInput(_)) => "invalid",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::Forbidden(_)) => "forbidden",
        Err(EngineError::TooManyRequests { .. }) => "rate_limited",
        Err(EngineError::Unavailable(_)) => "unavailable",
    }
}
