use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::MAX_LIST_LIMIT;
use crate::model::*;

use super::{Engine, EngineError};

/// Newest-first listing with the optional status filter applied. An explicit
/// limit is capped at `MAX_LIST_LIMIT`; no limit returns everything.
fn apply_filter(mut bookings: Vec<Booking>, filter: BookingFilter) -> Vec<Booking> {
    if let Some(status) = filter.status {
        bookings.retain(|b| b.status == status);
    }
    bookings.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
    bookings.drain(..filter.offset.min(bookings.len()));
    if let Some(limit) = filter.limit {
        bookings.truncate(limit.min(MAX_LIST_LIMIT));
    }
    bookings
}

impl Engine {
    // ── Mentors ──────────────────────────────────────────────

    pub async fn get_mentor(&self, id: Ulid) -> Result<Mentor, EngineError> {
        let ms = self.mentor_state(id)?;
        let guard = ms.read().await;
        Ok(guard.mentor.clone())
    }

    pub async fn mentor_by_account(&self, account_id: Ulid) -> Option<Mentor> {
        let mentor_id = *self.indexes.account_to_mentor.get(&account_id)?;
        let ms = self.get_mentor_state(&mentor_id)?;
        let guard = ms.read().await;
        Some(guard.mentor.clone())
    }

    pub async fn list_mentors(&self) -> Vec<Mentor> {
        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut mentors = Vec::with_capacity(states.len());
        for ms in states {
            mentors.push(ms.read().await.mentor.clone());
        }
        mentors
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let guard = self.resolve_entity_read(&id).await?;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn list_bookings_by_mentor(
        &self,
        mentor_id: Ulid,
        filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        let ms = self.mentor_state(mentor_id)?;
        let guard = ms.read().await;
        Ok(apply_filter(guard.bookings.clone(), filter))
    }

    pub async fn list_bookings_by_mentee(
        &self,
        mentee_id: Ulid,
        filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        let ids = self
            .indexes
            .mentee_bookings
            .get(&mentee_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            bookings.push(self.get_booking(id).await?);
        }
        Ok(apply_filter(bookings, filter))
    }

    /// Pending or confirmed bookings of one mentor starting in `[from, until)`.
    pub async fn active_bookings_starting(
        &self,
        mentor_id: Ulid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Booking>, EngineError> {
        let ms = self.mentor_state(mentor_id)?;
        let guard = ms.read().await;
        Ok(guard
            .starting_between(from, until)
            .filter(|b| b.status.is_active())
            .cloned()
            .collect())
    }

    /// Confirmed bookings of every mentor starting in `[from, until)`.
    pub async fn confirmed_starting_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<Booking> {
        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut due = Vec::new();
        for ms in states {
            let guard = ms.read().await;
            due.extend(
                guard
                    .starting_between(from, until)
                    .filter(|b| b.status == BookingStatus::Confirmed)
                    .cloned(),
            );
        }
        due.sort_by_key(|b| b.scheduled_at);
        due
    }

    // ── Slots ────────────────────────────────────────────────

    pub async fn get_slot(&self, id: Ulid) -> Result<AvailabilitySlot, EngineError> {
        let guard = self.resolve_entity_read(&id).await?;
        guard.slot(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn slots_for_mentor(
        &self,
        mentor_id: Ulid,
        include_inactive: bool,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let ms = self.mentor_state(mentor_id)?;
        let guard = ms.read().await;
        let mut slots: Vec<_> = guard
            .slots
            .iter()
            .filter(|s| include_inactive || s.is_active)
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.schedule.kind() == SlotKind::Specific, s.start_time));
        Ok(slots)
    }

    // ── Reviews ──────────────────────────────────────────────

    pub async fn reviews_for_mentor(
        &self,
        mentor_id: Ulid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Review>, EngineError> {
        let ms = self.mentor_state(mentor_id)?;
        let guard = ms.read().await;
        let mut reviews = guard.reviews.clone();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reviews
            .into_iter()
            .skip(offset)
            .take(limit.min(MAX_LIST_LIMIT))
            .collect())
    }

    /// Every review rating of a mentor, for aggregate recomputation.
    pub async fn review_ratings(&self, mentor_id: Ulid) -> Result<Vec<u8>, EngineError> {
        let ms = self.mentor_state(mentor_id)?;
        let guard = ms.read().await;
        Ok(guard.reviews.iter().map(|r| r.rating).collect())
    }

    pub fn mentor_count(&self) -> usize {
        self.state.len()
    }
}
