use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::conflict::{candidate_window, find_conflict};
use crate::limits::*;
use crate::model::*;

use super::availability::validate_slot_times;
use super::{Engine, EngineError, WalCommand};

fn check_version(id: Ulid, expected: Option<u64>, actual: u64) -> Result<(), EngineError> {
    match expected {
        Some(expected) if expected != actual => {
            metrics::counter!(crate::observability::VERSION_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::VersionConflict { id, expected, actual })
        }
        _ => Ok(()),
    }
}

/// Reject `booking` if it would overlap another active booking of the same mentor.
fn ensure_no_overlap(ms: &MentorState, booking: &Booking) -> Result<(), EngineError> {
    if !booking.status.is_active() {
        return Ok(());
    }
    let span = booking
        .span()
        .ok_or_else(|| EngineError::Validation("session duration must be positive".into()))?;
    let (from, until) = candidate_window(booking.scheduled_at, booking.ends_at());
    match find_conflict(ms.starting_between(from, until), &span, Some(booking.id)) {
        Some(other) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(Some(other)))
        }
        None => Ok(()),
    }
}

/// Copy every field the patch sets onto `booking`.
fn apply_patch(booking: &mut Booking, patch: BookingPatch) {
    let BookingPatch {
        status,
        scheduled_at,
        duration_minutes,
        topic,
        notes,
        meeting,
        session_notes,
        cancellation,
        rejection_reason,
        no_show_by,
        completed_at,
        rating,
        feedback,
    } = patch;
    if let Some(v) = status {
        booking.status = v;
    }
    if let Some(v) = scheduled_at {
        booking.scheduled_at = v;
    }
    if let Some(v) = duration_minutes {
        booking.duration_minutes = v;
    }
    if let Some(v) = topic {
        booking.topic = v;
    }
    if notes.is_some() {
        booking.notes = notes;
    }
    if meeting.is_some() {
        booking.meeting = meeting;
    }
    if session_notes.is_some() {
        booking.session_notes = session_notes;
    }
    if cancellation.is_some() {
        booking.cancellation = cancellation;
    }
    if rejection_reason.is_some() {
        booking.rejection_reason = rejection_reason;
    }
    if no_show_by.is_some() {
        booking.no_show_by = no_show_by;
    }
    if completed_at.is_some() {
        booking.completed_at = completed_at;
    }
    if rating.is_some() {
        booking.rating = rating;
    }
    if feedback.is_some() {
        booking.feedback = feedback;
    }
}

impl Engine {
    // ── Mentors ──────────────────────────────────────────────

    pub async fn insert_mentor(&self, mentor: Mentor) -> Result<Mentor, EngineError> {
        let _serial = self.profile_lock.lock().await;
        if self.state.contains_key(&mentor.id) {
            return Err(EngineError::AlreadyExists(mentor.id));
        }
        if let Some(existing) = self.indexes.account_to_mentor.get(&mentor.account_id) {
            return Err(EngineError::AlreadyExists(*existing));
        }

        let mut ms = MentorState::new(mentor.clone());
        self.persist_and_apply(&mut ms, Event::MentorSaved(mentor.clone()))
            .await?;
        self.state.insert(mentor.id, Arc::new(RwLock::new(ms)));
        tracing::info!(mentor_id = %mentor.id, approved = mentor.is_approved, "mentor profile created");
        Ok(mentor)
    }

    /// Conditional profile write: applies `patch` only if the stored version
    /// equals `expected_version`, then advances the version by one.
    pub async fn compare_and_swap_mentor(
        &self,
        id: Ulid,
        expected_version: u64,
        patch: MentorPatch,
    ) -> Result<Mentor, EngineError> {
        let ms = self.mentor_state(id)?;
        let mut guard = ms.write().await;
        check_version(id, Some(expected_version), guard.mentor.version)?;

        let mut mentor = guard.mentor.clone();
        if let Some(bio) = patch.bio {
            mentor.bio = bio;
        }
        if let Some(expertise) = patch.expertise {
            mentor.expertise = expertise;
        }
        if let Some(approved) = patch.is_approved {
            mentor.is_approved = approved;
        }
        mentor.version = expected_version + 1;
        mentor.updated_at = self.clock.now();

        self.persist_and_apply(&mut guard, Event::MentorSaved(mentor.clone()))
            .await?;
        Ok(mentor)
    }

    // ── Availability slots ───────────────────────────────────

    pub async fn insert_slots(
        &self,
        mentor_id: Ulid,
        slots: Vec<AvailabilitySlot>,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        if slots.iter().any(|s| s.mentor_id != mentor_id) {
            return Err(EngineError::Validation("slot belongs to another mentor".into()));
        }
        let ms = self.mentor_state(mentor_id)?;
        let mut guard = ms.write().await;
        if guard.slots.len() + slots.len() > MAX_SLOTS_PER_MENTOR {
            return Err(EngineError::LimitExceeded("too many availability slots"));
        }
        for slot in &slots {
            if guard.slot(slot.id).is_some() {
                return Err(EngineError::AlreadyExists(slot.id));
            }
        }
        for slot in &slots {
            self.persist_and_apply(&mut guard, Event::SlotSaved(slot.clone()))
                .await?;
        }
        Ok(slots)
    }

    pub async fn update_slot(
        &self,
        id: Ulid,
        expected_version: Option<u64>,
        patch: SlotPatch,
    ) -> Result<AvailabilitySlot, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let mut slot = guard.slot(id).cloned().ok_or(EngineError::NotFound(id))?;
        check_version(id, expected_version, slot.version)?;

        if let Some(schedule) = patch.schedule {
            slot.schedule = schedule;
        }
        if let Some(start) = patch.start_time {
            slot.start_time = start;
        }
        if let Some(end) = patch.end_time {
            slot.end_time = end;
        }
        if let Some(active) = patch.is_active {
            slot.is_active = active;
        }
        validate_slot_times(slot.start_time, slot.end_time)?;
        slot.version += 1;
        slot.updated_at = self.clock.now();

        self.persist_and_apply(&mut guard, Event::SlotSaved(slot.clone()))
            .await?;
        Ok(slot)
    }

    /// Soft-delete every active slot of `kind` (all kinds when `None`).
    pub async fn clear_slots(&self, mentor_id: Ulid, kind: Option<SlotKind>) -> Result<usize, EngineError> {
        let ms = self.mentor_state(mentor_id)?;
        let mut guard = ms.write().await;
        let now = self.clock.now();
        let targets: Vec<AvailabilitySlot> = guard
            .slots
            .iter()
            .filter(|s| s.is_active && kind.is_none_or(|k| s.schedule.kind() == k))
            .cloned()
            .collect();
        for mut slot in targets.iter().cloned() {
            slot.is_active = false;
            slot.version += 1;
            slot.updated_at = now;
            self.persist_and_apply(&mut guard, Event::SlotSaved(slot)).await?;
        }
        Ok(targets.len())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Persist a new `pending` booking. Re-checks overlap under the mentor's
    /// write lock, so two inserts for the same mentor can never both land.
    pub async fn create_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        let ms = self.mentor_state(new.mentor_id)?;
        let mut guard = ms.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_MENTOR {
            return Err(EngineError::LimitExceeded("too many bookings for mentor"));
        }

        let now = self.clock.now();
        let booking = Booking {
            id: Ulid::new(),
            mentor_id: new.mentor_id,
            mentee_id: new.mentee_id,
            scheduled_at: new.scheduled_at,
            duration_minutes: new.duration_minutes,
            topic: new.topic,
            notes: new.notes,
            mentee_goals: new.mentee_goals,
            status: BookingStatus::Pending,
            meeting: None,
            session_notes: None,
            cancellation: None,
            rejection_reason: None,
            no_show_by: None,
            completed_at: None,
            rating: None,
            feedback: None,
            reminders_sent: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        ensure_no_overlap(&guard, &booking)?;

        self.persist_and_apply(&mut guard, Event::BookingSaved(booking.clone()))
            .await?;
        Ok(booking)
    }

    /// Apply a restricted-field patch. Does not consult the state machine; it
    /// only guards the version (when given) and the no-overlap invariant.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let mut booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        check_version(id, expected_version, booking.version)?;

        let moves = patch.moves_schedule();
        let reactivates = patch.status.is_some_and(|s| s.is_active()) && !booking.status.is_active();
        apply_patch(&mut booking, patch);
        if moves || reactivates {
            ensure_no_overlap(&guard, &booking)?;
        }
        booking.version += 1;
        booking.updated_at = self.clock.now();

        self.persist_and_apply(&mut guard, Event::BookingSaved(booking.clone()))
            .await?;
        Ok(booking)
    }

    /// Complete a booking and count the session in one WAL record, so the
    /// two can never disagree. A booking that already completed is refused,
    /// which makes a retry after any failure safe.
    pub async fn complete_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let mut booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        check_version(id, expected_version, booking.version)?;
        if booking.status == BookingStatus::Completed {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                action: "complete",
            });
        }

        let now = self.clock.now();
        apply_patch(&mut booking, patch);
        booking.status = BookingStatus::Completed;
        if booking.completed_at.is_none() {
            booking.completed_at = Some(now);
        }
        booking.version += 1;
        booking.updated_at = now;

        // Session count is system-maintained: the profile version stays put.
        let mut mentor = guard.mentor.clone();
        mentor.total_sessions += 1;
        mentor.updated_at = now;

        self.persist_and_apply(
            &mut guard,
            Event::SessionCompleted {
                booking: booking.clone(),
                mentor,
            },
        )
        .await?;
        Ok(booking)
    }

    /// Record that `horizon`'s reminder went out. Returns false if it already
    /// had. Bookkeeping only: the booking version is left alone.
    pub async fn mark_reminded(&self, id: Ulid, horizon: ReminderHorizon) -> Result<bool, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let mut booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.reminded(horizon) {
            return Ok(false);
        }
        booking.reminders_sent.push(horizon);
        self.persist_and_apply(&mut guard, Event::BookingSaved(booking))
            .await?;
        Ok(true)
    }

    // ── Reviews ──────────────────────────────────────────────

    /// Store the first review of a booking, copy its rating onto the booking
    /// and recompute the mentor's mean rating, all in one WAL record.
    pub async fn record_review(&self, review: Review) -> Result<Review, EngineError> {
        let mut guard = self.resolve_entity_write(&review.booking_id).await?;
        let mut booking = guard
            .booking(review.booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(review.booking_id))?;
        if booking.mentor_id != review.mentor_id || booking.mentee_id != review.mentee_id {
            return Err(EngineError::Validation("review does not match its booking".into()));
        }
        if guard.review_for(review.booking_id).is_some() || booking.rating.is_some() {
            return Err(EngineError::FeedbackAlreadySubmitted(review.booking_id));
        }

        let now = self.clock.now();
        booking.rating = Some(review.rating);
        if review.comment.is_some() {
            booking.feedback = review.comment.clone();
        }
        booking.version += 1;
        booking.updated_at = now;

        let mut ratings: Vec<u8> = guard.reviews.iter().map(|r| r.rating).collect();
        ratings.push(review.rating);
        let mut mentor = guard.mentor.clone();
        mentor.rating = crate::booking::stats::mean_rating(&ratings);
        mentor.updated_at = now;

        self.persist_and_apply(
            &mut guard,
            Event::FeedbackRecorded {
                review: review.clone(),
                booking,
                mentor,
            },
        )
        .await?;
        Ok(review)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the latest image of every row.
    ///
    /// Every mentor stays read-locked until the rewrite is swapped in, so no
    /// append can land in the old file after its row was snapshotted.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _serial = self.profile_lock.lock().await;
        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(states.len());
        for ms in states {
            guards.push(ms.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::MentorSaved(guard.mentor.clone()));
            events.extend(guard.slots.iter().cloned().map(Event::SlotSaved));
            events.extend(guard.bookings.iter().cloned().map(Event::BookingSaved));
            events.extend(guard.reviews.iter().cloned().map(Event::ReviewAdded));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
