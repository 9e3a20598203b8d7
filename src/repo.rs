//! Storage capabilities the services are built on, passed in as explicit
//! handles. [`Engine`] implements all of them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn create(&self, new: NewBooking) -> Result<Booking, EngineError>;
    async fn get(&self, id: Ulid) -> Result<Booking, EngineError>;
    /// Restricted-field update. Stamps `updated_at` and bumps the version;
    /// when `expected_version` is given the write is conditional on it.
    async fn update(
        &self,
        id: Ulid,
        patch: BookingPatch,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError>;
    /// Mark the booking completed and count the session for its mentor as
    /// one write. Refuses a booking that already completed.
    async fn complete(
        &self,
        id: Ulid,
        patch: BookingPatch,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError>;
    async fn list_by_mentor(&self, mentor_id: Ulid, filter: BookingFilter) -> Result<Vec<Booking>, EngineError>;
    async fn list_by_mentee(&self, mentee_id: Ulid, filter: BookingFilter) -> Result<Vec<Booking>, EngineError>;
    async fn active_starting_between(
        &self,
        mentor_id: Ulid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Booking>, EngineError>;
    async fn confirmed_starting_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Booking>, EngineError>;
    async fn mark_reminded(&self, id: Ulid, horizon: ReminderHorizon) -> Result<bool, EngineError>;
}

#[async_trait]
pub trait MentorStore: Send + Sync {
    async fn insert(&self, mentor: Mentor) -> Result<Mentor, EngineError>;
    async fn get(&self, id: Ulid) -> Result<Mentor, EngineError>;
    async fn by_account(&self, account_id: Ulid) -> Result<Option<Mentor>, EngineError>;
    async fn list(&self) -> Result<Vec<Mentor>, EngineError>;
    async fn compare_and_swap(
        &self,
        id: Ulid,
        expected_version: u64,
        patch: MentorPatch,
    ) -> Result<Mentor, EngineError>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Store the review, rate the booking and refresh the mentor's mean
    /// rating as one write. Fails with `FeedbackAlreadySubmitted` if the
    /// booking already has a review.
    async fn record(&self, review: Review) -> Result<Review, EngineError>;
    async fn list_for_mentor(&self, mentor_id: Ulid, limit: usize, offset: usize) -> Result<Vec<Review>, EngineError>;
    async fn ratings_for_mentor(&self, mentor_id: Ulid) -> Result<Vec<u8>, EngineError>;
}

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn insert_many(&self, mentor_id: Ulid, slots: Vec<AvailabilitySlot>) -> Result<Vec<AvailabilitySlot>, EngineError>;
    async fn get(&self, id: Ulid) -> Result<AvailabilitySlot, EngineError>;
    async fn update(
        &self,
        id: Ulid,
        expected_version: Option<u64>,
        patch: SlotPatch,
    ) -> Result<AvailabilitySlot, EngineError>;
    async fn clear(&self, mentor_id: Ulid, kind: Option<SlotKind>) -> Result<usize, EngineError>;
    async fn list_for_mentor(&self, mentor_id: Ulid, include_inactive: bool) -> Result<Vec<AvailabilitySlot>, EngineError>;
}

/// One handle per capability. Usually all four point at the same store.
#[derive(Clone)]
pub struct StoreHandles {
    pub bookings: Arc<dyn BookingStore>,
    pub mentors: Arc<dyn MentorStore>,
    pub reviews: Arc<dyn ReviewStore>,
    pub slots: Arc<dyn AvailabilityStore>,
}

impl StoreHandles {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: BookingStore + MentorStore + ReviewStore + AvailabilityStore + 'static,
    {
        Self {
            bookings: store.clone(),
            mentors: store.clone(),
            reviews: store.clone(),
            slots: store,
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

#[async_trait]
impl BookingStore for Engine {
    async fn create(&self, new: NewBooking) -> Result<Booking, EngineError> {
        self.create_booking(new).await
    }

    async fn get(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.get_booking(id).await
    }

    async fn update(
        &self,
        id: Ulid,
        patch: BookingPatch,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        self.update_booking(id, patch, expected_version).await
    }

    async fn complete(
        &self,
        id: Ulid,
        patch: BookingPatch,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        self.complete_booking(id, patch, expected_version).await
    }

    async fn list_by_mentor(&self, mentor_id: Ulid, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings_by_mentor(mentor_id, filter).await
    }

    async fn list_by_mentee(&self, mentee_id: Ulid, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings_by_mentee(mentee_id, filter).await
    }

    async fn active_starting_between(
        &self,
        mentor_id: Ulid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Booking>, EngineError> {
        self.active_bookings_starting(mentor_id, from, until).await
    }

    async fn confirmed_starting_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Booking>, EngineError> {
        Ok(Engine::confirmed_starting_between(self, from, until).await)
    }

    async fn mark_reminded(&self, id: Ulid, horizon: ReminderHorizon) -> Result<bool, EngineError> {
        Engine::mark_reminded(self, id, horizon).await
    }
}

#[async_trait]
impl MentorStore for Engine {
    async fn insert(&self, mentor: Mentor) -> Result<Mentor, EngineError> {
        self.insert_mentor(mentor).await
    }

    async fn get(&self, id: Ulid) -> Result<Mentor, EngineError> {
        self.get_mentor(id).await
    }

    async fn by_account(&self, account_id: Ulid) -> Result<Option<Mentor>, EngineError> {
        Ok(self.mentor_by_account(account_id).await)
    }

    async fn list(&self) -> Result<Vec<Mentor>, EngineError> {
        Ok(self.list_mentors().await)
    }

    async fn compare_and_swap(
        &self,
        id: Ulid,
        expected_version: u64,
        patch: MentorPatch,
    ) -> Result<Mentor, EngineError> {
        self.compare_and_swap_mentor(id, expected_version, patch).await
    }
}

#[async_trait]
impl ReviewStore for Engine {
    async fn record(&self, review: Review) -> Result<Review, EngineError> {
        self.record_review(review).await
    }

    async fn list_for_mentor(&self, mentor_id: Ulid, limit: usize, offset: usize) -> Result<Vec<Review>, EngineError> {
        self.reviews_for_mentor(mentor_id, limit, offset).await
    }

    async fn ratings_for_mentor(&self, mentor_id: Ulid) -> Result<Vec<u8>, EngineError> {
        self.review_ratings(mentor_id).await
    }
}

#[async_trait]
impl AvailabilityStore for Engine {
    async fn insert_many(&self, mentor_id: Ulid, slots: Vec<AvailabilitySlot>) -> Result<Vec<AvailabilitySlot>, EngineError> {
        self.insert_slots(mentor_id, slots).await
    }

    async fn get(&self, id: Ulid) -> Result<AvailabilitySlot, EngineError> {
        self.get_slot(id).await
    }

    async fn update(
        &self,
        id: Ulid,
        expected_version: Option<u64>,
        patch: SlotPatch,
    ) -> Result<AvailabilitySlot, EngineError> {
        self.update_slot(id, expected_version, patch).await
    }

    async fn clear(&self, mentor_id: Ulid, kind: Option<SlotKind>) -> Result<usize, EngineError> {
        self.clear_slots(mentor_id, kind).await
    }

    async fn list_for_mentor(&self, mentor_id: Ulid, include_inactive: bool) -> Result<Vec<AvailabilitySlot>, EngineError> {
        self.slots_for_mentor(mentor_id, include_inactive).await
    }
}
