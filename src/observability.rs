use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::requests::RedeemOutcome;

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: bookings created. Labels: origin (single, series, waitlist).
pub const BOOKINGS_CREATED_TOTAL: &str = "courtside_bookings_created_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "courtside_bookings_cancelled_total";

/// Counter: write attempts rejected by the conflict check.
pub const CONFLICTS_TOTAL: &str = "courtside_conflicts_total";

/// Counter: series activation attempts. Labels: result.
pub const SERIES_ACTIVATIONS_TOTAL: &str = "courtside_series_activations_total";

// ── Waitlist metrics ────────────────────────────────────────────

/// Counter: waitlist joins accepted.
pub const WAITLIST_JOINS_TOTAL: &str = "courtside_waitlist_joins_total";

/// Counter: entries promoted to notified (a token was issued).
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "courtside_waitlist_promotions_total";

/// Counter: entries expired. Labels: reason.
pub const WAITLIST_EXPIRED_TOTAL: &str = "courtside_waitlist_expired_total";

/// Counter: redemption attempts. Labels: outcome.
pub const REDEMPTIONS_TOTAL: &str = "courtside_redemptions_total";

// ── Notification metrics ────────────────────────────────────────

/// Counter: notifications accepted by the notifier. Labels: channel.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "courtside_notifications_sent_total";

/// Counter: notifications that failed and were dropped. Labels: channel.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "courtside_notifications_failed_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "courtside_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a redemption outcome to a short label for metrics.
pub fn redeem_label(outcome: &RedeemOutcome) -> &'static str {
    match outcome {
        RedeemOutcome::Booked { .. } => "booked",
        RedeemOutcome::AlreadyBooked { .. } => "already_booked",
        RedeemOutcome::Expired => "expired",
        RedeemOutcome::SlotNoLongerAvailable => "slot_taken",
        RedeemOutcome::InvalidToken => "invalid_token",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn redeem_labels_are_distinct() {
        let id = Ulid::new();
        let labels = [
            redeem_label(&RedeemOutcome::Booked { booking_id: id }),
            redeem_label(&RedeemOutcome::AlreadyBooked { booking_id: id }),
            redeem_label(&RedeemOutcome::Expired),
            redeem_label(&RedeemOutcome::SlotNoLongerAvailable),
            redeem_label(&RedeemOutcome::InvalidToken),
        ];
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
        init_tracing();
        init_tracing();
    }
}
