use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Secondary lookups kept beside the per-mentor state.
#[derive(Default)]
pub(crate) struct Indexes {
    /// Slot/booking/review id → owning mentor id.
    pub entity_to_mentor: DashMap<Ulid, Ulid>,
    /// Mentee account → booking ids, in creation order.
    pub mentee_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Member account → mentor profile id.
    pub account_to_mentor: DashMap<Ulid, Ulid>,
}

fn save_mentor(ms: &mut MentorState, mentor: &Mentor, indexes: &Indexes) {
    indexes.account_to_mentor.insert(mentor.account_id, mentor.id);
    ms.mentor = mentor.clone();
}

fn save_booking(ms: &mut MentorState, booking: &Booking, indexes: &Indexes) {
    if ms.booking(booking.id).is_none() {
        indexes
            .mentee_bookings
            .entry(booking.mentee_id)
            .or_default()
            .push(booking.id);
    }
    indexes.entity_to_mentor.insert(booking.id, booking.mentor_id);
    ms.upsert_booking(booking.clone());
}

fn add_review(ms: &mut MentorState, review: &Review, indexes: &Indexes) {
    indexes.entity_to_mentor.insert(review.id, review.mentor_id);
    if ms.review_for(review.booking_id).is_none() {
        ms.reviews.push(review.clone());
    }
}

/// Apply an event directly to a MentorState. The caller holds the lock.
pub(crate) fn apply_event(ms: &mut MentorState, event: &Event, indexes: &Indexes) {
    match event {
        Event::MentorSaved(mentor) => save_mentor(ms, mentor, indexes),
        Event::SlotSaved(slot) => {
            indexes.entity_to_mentor.insert(slot.id, slot.mentor_id);
            ms.upsert_slot(slot.clone());
        }
        Event::BookingSaved(booking) => save_booking(ms, booking, indexes),
        Event::ReviewAdded(review) => add_review(ms, review, indexes),
        Event::SessionCompleted { booking, mentor } => {
            save_booking(ms, booking, indexes);
            save_mentor(ms, mentor, indexes);
        }
        Event::FeedbackRecorded {
            review,
            booking,
            mentor,
        } => {
            add_review(ms, review, indexes);
            save_booking(ms, booking, indexes);
            save_mentor(ms, mentor, indexes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{at, booking, mentor};

    #[test]
    fn booking_images_replace_and_index_once() {
        let indexes = Indexes::default();
        let mid = Ulid::new();
        let mut ms = MentorState::new(mentor(mid));
        let mut b = booking(mid, at(2025, 6, 1, 10, 0), 60);

        apply_event(&mut ms, &Event::BookingSaved(b.clone()), &indexes);
        b.status = BookingStatus::Confirmed;
        b.version = 2;
        apply_event(&mut ms, &Event::BookingSaved(b.clone()), &indexes);

        assert_eq!(ms.bookings.len(), 1);
        assert_eq!(ms.bookings[0].status, BookingStatus::Confirmed);
        assert_eq!(indexes.mentee_bookings.get(&b.mentee_id).unwrap().len(), 1);
        assert_eq!(*indexes.entity_to_mentor.get(&b.id).unwrap(), mid);
    }

    #[test]
    fn duplicate_review_image_is_ignored() {
        let indexes = Indexes::default();
        let mid = Ulid::new();
        let mut ms = MentorState::new(mentor(mid));
        let review = Review {
            id: Ulid::new(),
            mentor_id: mid,
            mentee_id: Ulid::new(),
            booking_id: Ulid::new(),
            rating: 4,
            comment: None,
            created_at: at(2025, 6, 1, 12, 0),
        };
        apply_event(&mut ms, &Event::ReviewAdded(review.clone()), &indexes);
        apply_event(&mut ms, &Event::ReviewAdded(Review { id: Ulid::new(), ..review }), &indexes);
        assert_eq!(ms.reviews.len(), 1);
    }

    #[test]
    fn completion_record_updates_booking_and_mentor() {
        let indexes = Indexes::default();
        let mid = Ulid::new();
        let mut ms = MentorState::new(mentor(mid));
        let mut b = booking(mid, at(2025, 6, 1, 10, 0), 60);
        apply_event(&mut ms, &Event::BookingSaved(b.clone()), &indexes);

        b.status = BookingStatus::Completed;
        let mut m = ms.mentor.clone();
        m.total_sessions = 1;
        apply_event(
            &mut ms,
            &Event::SessionCompleted {
                booking: b.clone(),
                mentor: m,
            },
            &indexes,
        );
        assert_eq!(ms.booking(b.id).unwrap().status, BookingStatus::Completed);
        assert_eq!(ms.mentor.total_sessions, 1);
        assert_eq!(indexes.mentee_bookings.get(&b.mentee_id).unwrap().len(), 1);
    }
}
