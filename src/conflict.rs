//! Overlap detection for a proposed session against a mentor's active bookings.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_SESSION_MINUTES;
use crate::model::{Booking, Span};
use crate::repo::BookingStore;

/// Start-time window that can hold a booking overlapping `[start, end)`.
///
/// Covers the calendar day of `start`, widened backwards by the longest
/// allowed session so a booking that began late the previous evening is still
/// seen, and forwards to `end` when the proposal crosses midnight.
pub fn candidate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day_start = start.date_naive().and_time(chrono::NaiveTime::MIN).and_utc();
    let day_end = day_start + Duration::days(1);
    let from = day_start - Duration::minutes(i64::from(MAX_SESSION_MINUTES));
    (from, day_end.max(end))
}

/// First active booking among `candidates` overlapping `proposed`.
///
/// A record whose interval cannot be computed counts as overlapping.
pub fn find_conflict<'a>(
    candidates: impl IntoIterator<Item = &'a Booking>,
    proposed: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    for booking in candidates {
        if Some(booking.id) == exclude || !booking.status.is_active() {
            continue;
        }
        match booking.span() {
            Some(span) if span.overlaps(proposed) => return Some(booking.id),
            Some(_) => {}
            None => {
                tracing::warn!(booking_id = %booking.id, "booking has no usable interval, treating as conflict");
                return Some(booking.id);
            }
        }
    }
    None
}

/// Read-only conflict query against a booking store. Always reads through to
/// the store; never consults a cache.
#[derive(Clone)]
pub struct ConflictChecker {
    bookings: Arc<dyn BookingStore>,
}

impl ConflictChecker {
    pub fn new(bookings: Arc<dyn BookingStore>) -> Self {
        Self { bookings }
    }

    /// `Conflict(Some(id))` names the overlapping booking. `Conflict(None)`
    /// means the answer could not be determined, which fails safe.
    pub async fn check(
        &self,
        mentor_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if end <= start {
            return Err(EngineError::Conflict(None));
        }
        let proposed = Span::between(start, end);
        let (from, until) = candidate_window(start, end);
        let candidates = match self.bookings.active_starting_between(mentor_id, from, until).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(mentor_id = %mentor_id, error = %e, "conflict lookup failed, treating as conflict");
                return Err(EngineError::Conflict(None));
            }
        };
        match find_conflict(&candidates, &proposed, exclude) {
            Some(other) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                tracing::debug!(mentor_id = %mentor_id, conflicting = %other, "proposed interval overlaps");
                Err(EngineError::Conflict(Some(other)))
            }
            None => Ok(()),
        }
    }

    pub async fn has_conflict(
        &self,
        mentor_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<Ulid>,
    ) -> bool {
        self.check(mentor_id, start, end, exclude).await.is_err()
    }
}
