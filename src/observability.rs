use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Request-driven ──────────────────────────────────────────────

/// Counter: availability checks. Labels: result.
pub const AVAILABILITY_CHECKS_TOTAL: &str = "venuebook_availability_checks_total";

/// Counter: bookings written.
pub const BOOKINGS_CREATED_TOTAL: &str = "venuebook_bookings_created_total";

/// Counter: creates rejected by the exclusion check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "venuebook_booking_conflicts_total";

/// Counter: committed lifecycle transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "venuebook_booking_transitions_total";

/// Counter: promo redemption attempts. Labels: result.
pub const PROMO_REDEMPTIONS_TOTAL: &str = "venuebook_promo_redemptions_total";

pub const TOKENS_ISSUED_TOTAL: &str = "venuebook_tokens_issued_total";

/// Counter: tokens that failed validation. Labels: reason.
pub const TOKEN_REJECTIONS_TOTAL: &str = "venuebook_token_rejections_total";

// ── Background work ─────────────────────────────────────────────

/// Histogram: sweep pass duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "venuebook_sweep_duration_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "venuebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "venuebook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
