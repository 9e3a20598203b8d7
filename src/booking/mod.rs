//! Booking workflows: request, transition, feedback and the side fields a
//! mentor attaches to a session.

pub mod state;
pub mod stats;

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use ulid::Ulid;
use validator::Validate;

use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::conflict::ConflictChecker;
use crate::engine::EngineError;
use crate::limits::{MAX_LIST_LIMIT, MAX_NOTES_LEN};
use crate::lock::{with_lock, LockGate, LockKey};
use crate::model::*;
use crate::notify::NotificationDispatcher;
use crate::repo::StoreHandles;

pub use state::Action;
pub use stats::{BookingCounts, MenteeStats, MentorStats, SessionHistory};

/// A mentee's request for a session.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BookingRequest {
    pub mentor_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Takes precedence over `duration_minutes` when both are given.
    pub end_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    #[validate(length(min = 1, max = 500))]
    pub topic: String,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(max = 2000))]
    pub mentee_goals: Option<String>,
}

pub struct BookingService {
    stores: StoreHandles,
    locks: Arc<dyn LockGate>,
    conflicts: ConflictChecker,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
}

impl BookingService {
    pub fn new(
        stores: StoreHandles,
        locks: Arc<dyn LockGate>,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            conflicts: ConflictChecker::new(stores.bookings.clone()),
            stores,
            locks,
            dispatcher,
            clock,
            policy,
        }
    }

    pub fn conflicts(&self) -> &ConflictChecker {
        &self.conflicts
    }

    /// Start instant and length of a session on `date`.
    fn resolve_schedule(
        &self,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: Option<NaiveTime>,
        duration_minutes: Option<u32>,
    ) -> Result<(DateTime<Utc>, u32), EngineError> {
        let minutes = match (end_time, duration_minutes) {
            (Some(end), _) => {
                if end <= start_time {
                    return Err(EngineError::Validation("end time must be after start time".into()));
                }
                (end - start_time).num_minutes()
            }
            (None, Some(d)) => i64::from(d),
            (None, None) => i64::from(self.policy.default_duration_minutes),
        };
        let (min, max) = (self.policy.min_duration_minutes, self.policy.max_duration_minutes);
        if minutes < i64::from(min) || minutes > i64::from(max) {
            return Err(EngineError::Validation(format!(
                "session must last between {min} and {max} minutes"
            )));
        }

        let start = date.and_time(start_time).and_utc();
        let now = self.clock.now();
        if start <= now {
            return Err(EngineError::Validation("session must start in the future".into()));
        }
        if start > now + Duration::days(self.policy.max_advance_days) {
            return Err(EngineError::Validation(format!(
                "sessions can be booked at most {} days ahead",
                self.policy.max_advance_days
            )));
        }
        Ok((start, minutes as u32))
    }

    fn lock_key(&self, mentor_id: Ulid, start: DateTime<Utc>) -> LockKey {
        LockKey::for_start(mentor_id, start, self.policy.lock_bucket_minutes)
    }

    /// Request a session. The conflict check and the insert run under the
    /// lock for the mentor's date and start bucket.
    pub async fn create_booking(&self, actor: Actor, req: BookingRequest) -> Result<Booking, EngineError> {
        let Actor::Mentee(mentee_id) = actor else {
            return Err(EngineError::Unauthorized("only mentees can request sessions"));
        };
        req.validate()?;
        if req.topic.trim().is_empty() {
            return Err(EngineError::Validation("topic must not be blank".into()));
        }
        let (start, minutes) =
            self.resolve_schedule(req.date, req.start_time, req.end_time, req.duration_minutes)?;

        let mentor = self.stores.mentors.get(req.mentor_id).await?;
        if !mentor.is_approved {
            return Err(EngineError::Validation("mentor is not accepting bookings".into()));
        }
        if mentor.account_id == mentee_id {
            return Err(EngineError::Validation("cannot book a session with yourself".into()));
        }

        let end = start + Duration::minutes(i64::from(minutes));
        let key = self.lock_key(mentor.id, start);
        let booking = with_lock(self.locks.as_ref(), key, async {
            self.conflicts.check(mentor.id, start, end, None).await?;
            self.stores
                .bookings
                .create(NewBooking {
                    mentor_id: mentor.id,
                    mentee_id,
                    scheduled_at: start,
                    duration_minutes: minutes,
                    topic: req.topic.trim().to_string(),
                    notes: req.notes,
                    mentee_goals: req.mentee_goals,
                })
                .await
        })
        .await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            booking_id = %booking.id,
            mentor_id = %booking.mentor_id,
            scheduled_at = %booking.scheduled_at,
            minutes,
            "booking requested"
        );
        self.dispatcher.notify_created(&booking);
        Ok(booking)
    }

    /// Apply `action` as `actor`. The write is conditional on the booking's
    /// version: the caller's `expected_version` when given, otherwise the
    /// version just read, so two racing transitions cannot both land.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        actor: Actor,
        action: Action,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let current = self.stores.bookings.get(booking_id).await?;
        // A caller acting on a stale copy hears about the version first.
        if let Some(expected) = expected_version
            && expected != current.version
        {
            metrics::counter!(crate::observability::VERSION_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::VersionConflict {
                id: booking_id,
                expected,
                actual: current.version,
            });
        }
        let role = state::authorize(&actor, &current, &action)?;
        let next = state::next_status(current.status, &action, role)?;
        let expected = expected_version.unwrap_or(current.version);
        let action_name = action.name();

        let now = self.clock.now();
        let patch = match action {
            Action::Reschedule {
                date,
                start_time,
                end_time,
            } => {
                return self
                    .reschedule(current, date, start_time, end_time, expected)
                    .await;
            }
            Action::Confirm => BookingPatch {
                status: Some(next),
                ..Default::default()
            },
            Action::Reject { reason } => BookingPatch {
                status: Some(next),
                rejection_reason: reason,
                ..Default::default()
            },
            Action::Cancel { reason } => BookingPatch {
                status: Some(next),
                cancellation: Some(Cancellation { reason, by: role, at: now }),
                ..Default::default()
            },
            Action::Complete { session_notes } => BookingPatch {
                status: Some(next),
                session_notes,
                completed_at: Some(now),
                ..Default::default()
            },
            Action::NoShow { party } => BookingPatch {
                status: Some(next),
                no_show_by: Some(party),
                ..Default::default()
            },
        };

        // Completion also counts the session, in the same write.
        let bookings = &self.stores.bookings;
        let updated = if next == BookingStatus::Completed {
            bookings.complete(booking_id, patch, Some(expected)).await?
        } else {
            bookings.update(booking_id, patch, Some(expected)).await?
        };

        metrics::counter!(
            crate::observability::TRANSITIONS_TOTAL,
            "action" => action_name,
            "to" => next.as_ref().to_string()
        )
        .increment(1);
        tracing::info!(
            booking_id = %booking_id,
            action = action_name,
            from = %current.status,
            to = %next,
            role = %role,
            "booking transitioned"
        );
        self.dispatcher
            .notify_status_changed(&updated, current.status, next);
        Ok(updated)
    }

    async fn reschedule(
        &self,
        current: Booking,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: Option<NaiveTime>,
        expected: u64,
    ) -> Result<Booking, EngineError> {
        let keep_length = end_time.is_none().then_some(current.duration_minutes);
        let (start, minutes) = self.resolve_schedule(date, start_time, end_time, keep_length)?;
        let end = start + Duration::minutes(i64::from(minutes));

        let key = self.lock_key(current.mentor_id, start);
        let updated = with_lock(self.locks.as_ref(), key, async {
            self.conflicts
                .check(current.mentor_id, start, end, Some(current.id))
                .await?;
            self.stores
                .bookings
                .update(
                    current.id,
                    BookingPatch {
                        status: Some(BookingStatus::Pending),
                        scheduled_at: Some(start),
                        duration_minutes: Some(minutes),
                        ..Default::default()
                    },
                    Some(expected),
                )
                .await
        })
        .await?;

        metrics::counter!(
            crate::observability::TRANSITIONS_TOTAL,
            "action" => "reschedule",
            "to" => BookingStatus::Pending.as_ref().to_string()
        )
        .increment(1);
        tracing::info!(
            booking_id = %current.id,
            from = %current.scheduled_at,
            to = %updated.scheduled_at,
            "booking rescheduled"
        );
        self.dispatcher
            .notify_rescheduled(&updated, current.status, current.scheduled_at);
        Ok(updated)
    }

    /// A mentee's rating of a completed session. One review per booking; the
    /// mentor's rating becomes the mean of all reviews.
    pub async fn submit_feedback(
        &self,
        booking_id: Ulid,
        actor: Actor,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Review, EngineError> {
        let booking = self.stores.bookings.get(booking_id).await?;
        if actor.party_in(&booking) != Some(Party::Mentee) {
            return Err(EngineError::Unauthorized("only the booking's mentee may leave feedback"));
        }
        if !(1..=5).contains(&rating) {
            return Err(EngineError::Validation("rating must be between 1 and 5".into()));
        }
        if comment.as_ref().is_some_and(|c| c.chars().count() > MAX_NOTES_LEN) {
            return Err(EngineError::Validation(format!(
                "feedback must be at most {MAX_NOTES_LEN} characters"
            )));
        }
        if booking.status != BookingStatus::Completed {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                action: "review",
            });
        }
        if booking.rating.is_some() {
            return Err(EngineError::FeedbackAlreadySubmitted(booking_id));
        }

        let review = self
            .stores
            .reviews
            .record(Review {
                id: Ulid::new(),
                mentor_id: booking.mentor_id,
                mentee_id: booking.mentee_id,
                booking_id,
                rating,
                comment,
                created_at: self.clock.now(),
            })
            .await?;
        tracing::info!(booking_id = %booking_id, mentor_id = %booking.mentor_id, rating, "feedback recorded");
        Ok(review)
    }

    /// Attach the video call link. `platform` defaults to zoom.
    pub async fn add_meeting_link(
        &self,
        booking_id: Ulid,
        actor: Actor,
        url: &str,
        platform: Option<String>,
    ) -> Result<Booking, EngineError> {
        let booking = self.mentor_owned(booking_id, &actor).await?;
        let parsed = url::Url::parse(url)
            .map_err(|e| EngineError::Validation(format!("invalid meeting link: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::Validation("meeting link must be an http(s) URL".into()));
        }
        if !booking.status.is_active() {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                action: "attach a meeting link to",
            });
        }
        let platform = platform
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "zoom".to_string());
        self.stores
            .bookings
            .update(
                booking_id,
                BookingPatch {
                    meeting: Some(MeetingLink {
                        url: parsed.to_string(),
                        platform,
                    }),
                    ..Default::default()
                },
                Some(booking.version),
            )
            .await
    }

    pub async fn add_session_notes(
        &self,
        booking_id: Ulid,
        actor: Actor,
        notes: String,
    ) -> Result<Booking, EngineError> {
        let booking = self.mentor_owned(booking_id, &actor).await?;
        if notes.chars().count() > MAX_NOTES_LEN {
            return Err(EngineError::Validation(format!(
                "session notes must be at most {MAX_NOTES_LEN} characters"
            )));
        }
        self.stores
            .bookings
            .update(
                booking_id,
                BookingPatch {
                    session_notes: Some(notes),
                    ..Default::default()
                },
                Some(booking.version),
            )
            .await
    }

    async fn mentor_owned(&self, booking_id: Ulid, actor: &Actor) -> Result<Booking, EngineError> {
        let booking = self.stores.bookings.get(booking_id).await?;
        if actor.party_in(&booking) != Some(Party::Mentor) {
            return Err(EngineError::Unauthorized("only the booking's mentor may do this"));
        }
        Ok(booking)
    }

    // ── Reads ────────────────────────────────────────────────

    /// Visible to its two parties and to admins.
    pub async fn get_booking(&self, booking_id: Ulid, actor: Actor) -> Result<Booking, EngineError> {
        let booking = self.stores.bookings.get(booking_id).await?;
        if actor.party_in(&booking).is_none() && actor != Actor::Admin {
            return Err(EngineError::Unauthorized("not a party to this booking"));
        }
        Ok(booking)
    }

    pub async fn list_mentor_bookings(
        &self,
        mentor_id: Ulid,
        actor: Actor,
        filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        if actor != Actor::Mentor(mentor_id) && actor != Actor::Admin {
            return Err(EngineError::Unauthorized("not this mentor's bookings"));
        }
        self.stores.bookings.list_by_mentor(mentor_id, filter).await
    }

    pub async fn list_mentee_bookings(
        &self,
        mentee_id: Ulid,
        actor: Actor,
        filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        if actor != Actor::Mentee(mentee_id) && actor != Actor::Admin {
            return Err(EngineError::Unauthorized("not this mentee's bookings"));
        }
        self.stores.bookings.list_by_mentee(mentee_id, filter).await
    }

    /// Completed sessions for a mentee, `page_size` at a time. Pages count
    /// from 1; a page past the end is empty.
    pub async fn mentee_history(
        &self,
        mentee_id: Ulid,
        actor: Actor,
        page: usize,
        page_size: usize,
    ) -> Result<SessionHistory, EngineError> {
        if page == 0 {
            return Err(EngineError::Validation("page starts at 1".into()));
        }
        if page_size == 0 || page_size > MAX_LIST_LIMIT {
            return Err(EngineError::Validation(format!(
                "page size must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        let completed = BookingFilter {
            status: Some(BookingStatus::Completed),
            ..Default::default()
        };
        let mut sessions = self.list_mentee_bookings(mentee_id, actor, completed).await?;
        let count = sessions.len();
        let skip = (page - 1).saturating_mul(page_size).min(count);
        sessions.drain(..skip);
        sessions.truncate(page_size);
        Ok(SessionHistory {
            sessions,
            count,
            page,
            page_size,
        })
    }

    pub async fn mentor_stats(&self, mentor_id: Ulid) -> Result<MentorStats, EngineError> {
        let mentor = self.stores.mentors.get(mentor_id).await?;
        let bookings = self
            .stores
            .bookings
            .list_by_mentor(mentor_id, BookingFilter::default())
            .await?;
        let review_count = self.stores.reviews.ratings_for_mentor(mentor_id).await?.len();
        Ok(MentorStats {
            bookings: stats::summarize(&bookings, self.clock.now()),
            total_sessions: mentor.total_sessions,
            rating: mentor.rating,
            review_count,
        })
    }

    pub async fn mentee_stats(&self, mentee_id: Ulid) -> Result<MenteeStats, EngineError> {
        let bookings = self
            .stores
            .bookings
            .list_by_mentee(mentee_id, BookingFilter::default())
            .await?;
        Ok(MenteeStats {
            reviews_given: bookings.iter().filter(|b| b.rating.is_some()).count(),
            bookings: stats::summarize(&bookings, self.clock.now()),
        })
    }
}
