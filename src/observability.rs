use std::net::SocketAddr;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "mentorbook_bookings_created_total";

/// Counter: requests rejected because the interval was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "mentorbook_booking_conflicts_total";

/// Counter: state machine transitions applied. Labels: action, to.
pub const TRANSITIONS_TOTAL: &str = "mentorbook_transitions_total";

/// Counter: conditional writes that lost to a newer version.
pub const VERSION_CONFLICTS_TOTAL: &str = "mentorbook_version_conflicts_total";

/// Histogram: time spent waiting for a booking lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "mentorbook_lock_wait_seconds";

/// Counter: lock acquisitions that timed out.
pub const LOCK_TIMEOUTS_TOTAL: &str = "mentorbook_lock_timeouts_total";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notifications accepted onto the queue. Labels: kind.
pub const NOTIFICATIONS_ENQUEUED_TOTAL: &str = "mentorbook_notifications_enqueued_total";

/// Counter: emails handed to the mailer successfully.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "mentorbook_notifications_sent_total";

/// Counter: notifications dropped because the queue was full or closed.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "mentorbook_notifications_dropped_total";

/// Counter: deliveries abandoned after a permanent error or exhausted retries.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "mentorbook_notifications_failed_total";

/// Counter: reminder notifications scheduled. Labels: horizon.
pub const REMINDERS_SENT_TOTAL: &str = "mentorbook_reminders_sent_total";

// ── Storage ─────────────────────────────────────────────────────

/// Counter: circuit breaker trips. Labels: breaker.
pub const BREAKER_OPENED_TOTAL: &str = "mentorbook_breaker_opened_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "mentorbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "mentorbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!(error = %e, "failed to install Prometheus metrics exporter"),
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        _ => subscriber
            .with(fmt::layer().pretty().with_target(true))
            .try_init(),
    }
}
