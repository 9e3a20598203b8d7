use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Barrier};
use ulid::Ulid;

use mentorbook::booking::{Action, BookingRequest, BookingService};
use mentorbook::breaker::BreakerConfig;
use mentorbook::clock::ManualClock;
use mentorbook::config::BookingPolicy;
use mentorbook::engine::{Engine, EngineError};
use mentorbook::lock::AdvisoryLocks;
use mentorbook::mentor::{MentorService, NewMentorProfile};
use mentorbook::model::{Actor, BookingFilter, BookingStatus, Mentor, MentorPatch};
use mentorbook::notify::{Notification, NotificationDispatcher, NotificationKind};
use mentorbook::repo::StoreHandles;

// ── Test infrastructure ──────────────────────────────────────

struct Harness {
    clock: Arc<ManualClock>,
    engine: Arc<Engine>,
    bookings: Arc<BookingService>,
    mentors: MentorService,
    rx: mpsc::Receiver<Notification>,
}

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mentorbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn harness(name: &str) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 20, 9, 0, 0).unwrap()));
    let engine = Arc::new(Engine::new(wal_path(name), clock.clone(), Default::default()).unwrap());
    let stores = StoreHandles::shared(engine.clone());
    let (dispatcher, rx) = NotificationDispatcher::channel(256);
    let bookings = Arc::new(BookingService::new(
        stores.clone(),
        Arc::new(AdvisoryLocks::new(Duration::from_secs(5))),
        dispatcher,
        clock.clone(),
        BookingPolicy::default(),
    ));
    let mentors = MentorService::new(stores, clock.clone(), Duration::from_secs(300));
    Harness {
        clock,
        engine,
        bookings,
        mentors,
        rx,
    }
}

async fn approved_mentor(h: &Harness) -> Mentor {
    let account_id = Ulid::new();
    let profile = h
        .mentors
        .create_profile(
            Actor::Mentee(account_id),
            NewMentorProfile {
                account_id,
                bio: "Hiring manager, ten years in backend teams".into(),
                expertise: vec!["Resumes".into(), "interviews".into()],
            },
        )
        .await
        .unwrap();
    assert!(!profile.is_approved);
    h.mentors.approve(Actor::Admin, profile.id, profile.version).await.unwrap()
}

fn request(mentor_id: Ulid, day: u32, hour: u32) -> BookingRequest {
    BookingRequest {
        mentor_id,
        date: NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
        start_time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(hour + 1, 0, 0),
        duration_minutes: None,
        topic: "Resume review".into(),
        notes: None,
        mentee_goals: None,
    }
}

/// Request, confirm and complete one session; returns the booking id and mentee.
async fn completed_session(h: &Harness, mentor: &Mentor, day: u32) -> (Ulid, Actor) {
    let mentee = Actor::Mentee(Ulid::new());
    let b = h.bookings.create_booking(mentee, request(mentor.id, day, 10)).await.unwrap();
    let as_mentor = Actor::Mentor(mentor.id);
    h.bookings.transition(b.id, as_mentor, Action::Confirm, None).await.unwrap();
    h.bookings
        .transition(b.id, as_mentor, Action::Complete { session_notes: None }, None)
        .await
        .unwrap();
    (b.id, mentee)
}

fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

// ── Scenario ─────────────────────────────────────────────────

#[tokio::test]
async fn request_confirm_complete_review() {
    let mut h = harness("e2e.wal");
    let mentor = approved_mentor(&h).await;
    let mentee = Actor::Mentee(Ulid::new());
    let as_mentor = Actor::Mentor(mentor.id);

    let booking = h.bookings.create_booking(mentee, request(mentor.id, 1, 10)).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.scheduled_at, Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap());
    assert_eq!(booking.duration_minutes, 60);
    assert_eq!(drain(&mut h.rx)[0].kind, NotificationKind::Created);

    let confirmed = h
        .bookings
        .transition(booking.id, as_mentor, Action::Confirm, None)
        .await
        .unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    let queued = drain(&mut h.rx);
    assert_eq!(queued.len(), 1);
    assert_eq!(
        queued[0].kind,
        NotificationKind::StatusChanged {
            old: BookingStatus::Pending,
            new: BookingStatus::Confirmed
        }
    );

    let completed = h
        .bookings
        .transition(
            booking.id,
            as_mentor,
            Action::Complete {
                session_notes: Some("Tightened the summary section".into()),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(completed.status, BookingStatus::Completed);
    assert!(completed.completed_at.is_some());
    assert_eq!(h.mentors.get(mentor.id).await.unwrap().total_sessions, 1);

    let review = h
        .bookings
        .submit_feedback(booking.id, mentee, 5, Some("Very helpful".into()))
        .await
        .unwrap();
    assert_eq!(review.rating, 5);
    assert_eq!(h.mentors.get(mentor.id).await.unwrap().rating, Decimal::new(500, 2));

    let again = h
        .bookings
        .submit_feedback(booking.id, mentee, 4, None)
        .await
        .unwrap_err();
    assert!(matches!(again, EngineError::FeedbackAlreadySubmitted(_)));
    assert!(again.to_string().contains("already submitted"));

    let stats = h.bookings.mentor_stats(mentor.id).await.unwrap();
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.review_count, 1);
    assert_eq!(stats.bookings.total, 1);
}

// ── Concurrency ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_slot_book_once() {
    let h = harness("concurrent.wal");
    let mentor = approved_mentor(&h).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let bookings = h.bookings.clone();
        let mut req = request(mentor.id, 1, 10);
        // Half the racers ask for a partially overlapping half hour.
        if i % 2 == 1 {
            req.start_time = NaiveTime::from_hms_opt(10, 30, 0).unwrap();
            req.end_time = NaiveTime::from_hms_opt(11, 0, 0);
        }
        handles.push(tokio::spawn(async move {
            bookings.create_booking(Actor::Mentee(Ulid::new()), req).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);

    let stored = h
        .engine
        .list_bookings_by_mentor(
            mentor.id,
            BookingFilter {
                status: Some(BookingStatus::Pending),
                limit: None,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_confirm_and_cancel_have_one_winner() {
    let h = harness("confirm_cancel_race.wal");
    let mentor = approved_mentor(&h).await;

    for day in 1..=8 {
        let mentee = Actor::Mentee(Ulid::new());
        let b = h.bookings.create_booking(mentee, request(mentor.id, day, 10)).await.unwrap();
        let (id, version) = (b.id, b.version);
        let start = Arc::new(Barrier::new(2));

        let confirm = tokio::spawn({
            let (bookings, start) = (h.bookings.clone(), start.clone());
            let as_mentor = Actor::Mentor(mentor.id);
            async move {
                start.wait().await;
                bookings.transition(id, as_mentor, Action::Confirm, Some(version)).await
            }
        });
        let cancel = tokio::spawn({
            let (bookings, start) = (h.bookings.clone(), start.clone());
            async move {
                start.wait().await;
                bookings
                    .transition(id, mentee, Action::Cancel { reason: None }, Some(version))
                    .await
            }
        });
        let outcomes = [confirm.await.unwrap(), cancel.await.unwrap()];

        let winners: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "day {day}: {outcomes:?}");
        assert!(
            outcomes
                .iter()
                .any(|r| matches!(r, Err(EngineError::VersionConflict { .. }))),
            "day {day}: {outcomes:?}"
        );
        let stored = h.engine.get_booking(id).await.unwrap();
        assert_eq!(stored.status, winners[0].status);
        assert_eq!(stored.version, version + 1);
    }
}

#[tokio::test]
async fn adjacent_sessions_both_book() {
    let h = harness("adjacent.wal");
    let mentor = approved_mentor(&h).await;
    h.bookings
        .create_booking(Actor::Mentee(Ulid::new()), request(mentor.id, 1, 10))
        .await
        .unwrap();
    h.bookings
        .create_booking(Actor::Mentee(Ulid::new()), request(mentor.id, 1, 11))
        .await
        .unwrap();
}

// ── State machine ────────────────────────────────────────────

#[tokio::test]
async fn terminal_bookings_accept_no_further_transitions() {
    let h = harness("terminal.wal");
    let mentor = approved_mentor(&h).await;
    let as_mentor = Actor::Mentor(mentor.id);

    let mut terminal = Vec::new();
    let (completed, _) = completed_session(&h, &mentor, 2).await;
    terminal.push(completed);

    let mentee = Actor::Mentee(Ulid::new());
    let b = h.bookings.create_booking(mentee, request(mentor.id, 3, 10)).await.unwrap();
    h.bookings
        .transition(b.id, as_mentor, Action::Reject { reason: Some("Out of scope".into()) }, None)
        .await
        .unwrap();
    terminal.push(b.id);

    let b = h.bookings.create_booking(mentee, request(mentor.id, 4, 10)).await.unwrap();
    h.bookings
        .transition(b.id, mentee, Action::Cancel { reason: None }, None)
        .await
        .unwrap();
    terminal.push(b.id);

    let b = h.bookings.create_booking(mentee, request(mentor.id, 5, 10)).await.unwrap();
    h.bookings.transition(b.id, as_mentor, Action::Confirm, None).await.unwrap();
    h.bookings
        .transition(b.id, as_mentor, Action::NoShow { party: mentorbook::model::Party::Mentee }, None)
        .await
        .unwrap();
    terminal.push(b.id);

    for id in terminal {
        let before = h.engine.get_booking(id).await.unwrap();
        for action in [
            Action::Confirm,
            Action::Cancel { reason: None },
            Action::Complete { session_notes: None },
        ] {
            let actor = match action {
                Action::Cancel { .. } => Actor::Admin,
                _ => as_mentor,
            };
            assert!(matches!(
                h.bookings.transition(id, actor, action, None).await,
                Err(EngineError::InvalidTransition { .. })
            ));
        }
        let after = h.engine.get_booking(id).await.unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.version, before.version);
    }
}

#[tokio::test]
async fn repeated_completion_counts_one_session() {
    let h = harness("complete_twice.wal");
    let mentor = approved_mentor(&h).await;
    let (id, _) = completed_session(&h, &mentor, 2).await;
    let completed = h.engine.get_booking(id).await.unwrap();

    // A retry with the pre-completion version loses on the version guard.
    assert!(matches!(
        h.bookings
            .transition(
                id,
                Actor::Mentor(mentor.id),
                Action::Complete { session_notes: None },
                Some(completed.version - 1),
            )
            .await,
        Err(EngineError::VersionConflict { .. })
    ));
    // A fresh retry sees a terminal booking.
    assert!(matches!(
        h.bookings
            .transition(id, Actor::Mentor(mentor.id), Action::Complete { session_notes: None }, None)
            .await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert_eq!(h.mentors.get(mentor.id).await.unwrap().total_sessions, 1);
}

#[tokio::test]
async fn mentee_history_pages_completed_sessions() {
    let h = harness("history.wal");
    let mentor = approved_mentor(&h).await;
    let mentee_id = Ulid::new();
    let mentee = Actor::Mentee(mentee_id);
    let as_mentor = Actor::Mentor(mentor.id);

    let mut completed = Vec::new();
    for day in 2..=4 {
        let b = h.bookings.create_booking(mentee, request(mentor.id, day, 10)).await.unwrap();
        h.bookings.transition(b.id, as_mentor, Action::Confirm, None).await.unwrap();
        h.bookings
            .transition(b.id, as_mentor, Action::Complete { session_notes: None }, None)
            .await
            .unwrap();
        completed.push(b.id);
    }
    // Still pending, so not history.
    h.bookings.create_booking(mentee, request(mentor.id, 5, 10)).await.unwrap();

    let first = h.bookings.mentee_history(mentee_id, mentee, 1, 2).await.unwrap();
    assert_eq!(first.count, 3);
    assert_eq!((first.page, first.page_size), (1, 2));
    assert_eq!(
        first.sessions.iter().map(|b| b.id).collect::<Vec<_>>(),
        vec![completed[2], completed[1]]
    );

    let second = h.bookings.mentee_history(mentee_id, mentee, 2, 2).await.unwrap();
    assert_eq!(second.sessions.iter().map(|b| b.id).collect::<Vec<_>>(), vec![completed[0]]);
    assert!(h.bookings.mentee_history(mentee_id, mentee, 3, 2).await.unwrap().sessions.is_empty());

    assert!(matches!(
        h.bookings.mentee_history(mentee_id, mentee, 0, 2).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        h.bookings.mentee_history(mentee_id, Actor::Mentee(Ulid::new()), 1, 2).await,
        Err(EngineError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn reschedule_returns_to_pending() {
    let mut h = harness("reschedule.wal");
    let mentor = approved_mentor(&h).await;
    let mentee = Actor::Mentee(Ulid::new());
    let b = h.bookings.create_booking(mentee, request(mentor.id, 1, 10)).await.unwrap();
    h.bookings
        .transition(b.id, Actor::Mentor(mentor.id), Action::Confirm, None)
        .await
        .unwrap();
    let blocker = h
        .bookings
        .create_booking(Actor::Mentee(Ulid::new()), request(mentor.id, 2, 14))
        .await
        .unwrap();
    drain(&mut h.rx);

    let clash = Action::Reschedule {
        date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
        start_time: NaiveTime::from_hms_opt(14, 30, 0).unwrap(),
        end_time: None,
    };
    match h.bookings.transition(b.id, mentee, clash, None).await {
        Err(EngineError::Conflict(Some(id))) => assert_eq!(id, blocker.id),
        other => panic!("expected conflict, got {other:?}"),
    }

    let moved = h
        .bookings
        .transition(
            b.id,
            mentee,
            Action::Reschedule {
                date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: None,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(moved.status, BookingStatus::Pending);
    assert_eq!(moved.duration_minutes, 60);
    assert_eq!(moved.scheduled_at, Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap());
    let queued = drain(&mut h.rx);
    assert_eq!(queued.len(), 1);
    assert!(matches!(
        queued[0].kind,
        NotificationKind::Rescheduled { old: BookingStatus::Confirmed, .. }
    ));
}

#[tokio::test]
async fn storage_outage_leaves_completion_and_feedback_retryable() {
    let mut h = harness("outage.wal");
    let mentor = approved_mentor(&h).await;
    let mentee = Actor::Mentee(Ulid::new());
    let as_mentor = Actor::Mentor(mentor.id);
    let b = h.bookings.create_booking(mentee, request(mentor.id, 1, 10)).await.unwrap();
    h.bookings.transition(b.id, as_mentor, Action::Confirm, None).await.unwrap();
    drain(&mut h.rx);
    let threshold = BreakerConfig::default().failure_threshold;

    for _ in 0..threshold {
        h.engine.breaker().record_failure();
    }
    let complete = || Action::Complete { session_notes: None };
    let err = h.bookings.transition(b.id, as_mentor, complete(), None).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.engine.get_booking(b.id).await.unwrap().status, BookingStatus::Confirmed);
    assert_eq!(h.mentors.get(mentor.id).await.unwrap().total_sessions, 0);
    assert!(drain(&mut h.rx).is_empty());

    // Storage is back: the retry completes and counts the session.
    h.clock.advance(chrono::Duration::seconds(31));
    h.bookings.transition(b.id, as_mentor, complete(), None).await.unwrap();
    assert_eq!(h.mentors.get(mentor.id).await.unwrap().total_sessions, 1);
    let queued = drain(&mut h.rx);
    assert_eq!(queued.len(), 1);
    assert_eq!(
        queued[0].kind,
        NotificationKind::StatusChanged {
            old: BookingStatus::Confirmed,
            new: BookingStatus::Completed
        }
    );

    for _ in 0..threshold {
        h.engine.breaker().record_failure();
    }
    let err = h.bookings.submit_feedback(b.id, mentee, 4, None).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.engine.get_booking(b.id).await.unwrap().rating, None);

    h.clock.advance(chrono::Duration::seconds(31));
    h.bookings.submit_feedback(b.id, mentee, 4, None).await.unwrap();
    assert_eq!(h.mentors.get(mentor.id).await.unwrap().rating, Decimal::new(400, 2));
}

// ── Ratings and versions ─────────────────────────────────────

#[tokio::test]
async fn rating_is_mean_of_reviews() {
    let h = harness("ratings.wal");
    let mentor = approved_mentor(&h).await;
    for (day, rating) in [(2, 5), (3, 4), (4, 3)] {
        let (id, mentee) = completed_session(&h, &mentor, day).await;
        h.bookings.submit_feedback(id, mentee, rating, None).await.unwrap();
    }
    let m = h.mentors.get(mentor.id).await.unwrap();
    assert_eq!(m.rating, Decimal::new(400, 2));
    assert_eq!(m.rating.to_string(), "4.00");
    assert_eq!(m.total_sessions, 3);
}

#[tokio::test]
async fn mentor_versions_advance_once_per_swap() {
    let h = harness("versions.wal");
    let mentor = approved_mentor(&h).await;
    let initial = mentor.version;

    let mut version = initial;
    for i in 0..5 {
        let updated = h
            .engine
            .compare_and_swap_mentor(
                mentor.id,
                version,
                MentorPatch {
                    bio: Some(format!("bio revision {i}")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        version = updated.version;
    }
    assert_eq!(version, initial + 5);

    assert!(matches!(
        h.engine
            .compare_and_swap_mentor(mentor.id, initial, MentorPatch::default())
            .await,
        Err(EngineError::VersionConflict { .. })
    ));
    assert_eq!(h.engine.get_mentor(mentor.id).await.unwrap().version, initial + 5);
}
