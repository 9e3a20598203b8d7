use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::lock::AdvisoryLocks;
use crate::mentor::MentorService;
use crate::model::ReminderHorizon;
use crate::notify::NotificationDispatcher;
use crate::repo::BookingStore;

/// Queue one reminder for every confirmed booking starting inside the
/// horizon's window that has not had this reminder yet. Returns how many
/// were queued.
pub async fn sweep_reminders(
    bookings: &dyn BookingStore,
    dispatcher: &NotificationDispatcher,
    clock: &dyn Clock,
    horizon: ReminderHorizon,
) -> Result<usize, EngineError> {
    let now = clock.now();
    let (lo, hi) = horizon.window();
    let due = bookings.confirmed_starting_between(now + lo, now + hi).await?;

    let mut queued = 0;
    for booking in due {
        if booking.reminded(horizon) {
            continue;
        }
        match bookings.mark_reminded(booking.id, horizon).await {
            Ok(true) => {
                dispatcher.notify_reminder(&booking, horizon);
                queued += 1;
            }
            // Another sweep got there first.
            Ok(false) => {}
            Err(e) => tracing::warn!(booking_id = %booking.id, %horizon, error = %e, "reminder skipped"),
        }
    }
    if queued > 0 {
        metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL, "horizon" => horizon.as_ref().to_string())
            .increment(queued as u64);
        info!(%horizon, queued, "reminders queued");
    }
    Ok(queued)
}

/// Run `sweep_reminders` every `every` until shutdown.
pub async fn run_reminders(
    bookings: Arc<dyn BookingStore>,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    horizon: ReminderHorizon,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweep_reminders(bookings.as_ref(), &dispatcher, clock.as_ref(), horizon).await {
                    tracing::warn!(%horizon, error = %e, "reminder sweep failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!(%horizon, "reminder loop stopped");
}

/// Periodically drop idle lock entries, dead feed channels and expired
/// search cache entries.
pub async fn run_housekeeping(
    locks: Arc<AdvisoryLocks>,
    dispatcher: NotificationDispatcher,
    mentors: Arc<MentorService>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let locks_pruned = locks.prune_idle();
                let channels_pruned = dispatcher.hub().prune_closed();
                let cache_purged = mentors.purge_cache();
                tracing::debug!(locks_pruned, channels_pruned, cache_purged, "housekeeping");
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Compact the WAL once enough appends have accumulated.
pub async fn run_compactor(
    engine: Arc<Engine>,
    threshold: u64,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!(appends, "compacted WAL"),
                    Err(e) => tracing::error!(error = %e, "WAL compaction failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
