use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use ulid::Ulid;

/// Unix milliseconds, the unit of all interval math.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.start)
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.end)
    }
}

// ── Roles ────────────────────────────────────────────────────────

/// One side of a booking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Party {
    Mentor,
    Mentee,
}

/// Who performed an action. Admins are not a booking party.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Mentor,
    Mentee,
    Admin,
}

impl From<Party> for Role {
    fn from(party: Party) -> Self {
        match party {
            Party::Mentor => Role::Mentor,
            Party::Mentee => Role::Mentee,
        }
    }
}

/// The caller of an operation, resolved once per request by whoever
/// authenticates it.
///
/// `Mentor` carries the mentor profile id, `Mentee` the member account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    Mentor(Ulid),
    Mentee(Ulid),
    Admin,
}

impl Actor {
    pub fn role(&self) -> Role {
        match self {
            Actor::Mentor(_) => Role::Mentor,
            Actor::Mentee(_) => Role::Mentee,
            Actor::Admin => Role::Admin,
        }
    }

    /// The party this actor plays on `booking`, if any.
    pub fn party_in(&self, booking: &Booking) -> Option<Party> {
        match self {
            Actor::Mentor(id) if *id == booking.mentor_id => Some(Party::Mentor),
            Actor::Mentee(id) if *id == booking.mentee_id => Some(Party::Mentee),
            _ => None,
        }
    }
}

// ── Mentor ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mentor {
    pub id: Ulid,
    /// Member account that owns this profile.
    pub account_id: Ulid,
    pub bio: String,
    pub expertise: Vec<String>,
    pub is_approved: bool,
    /// Mean of all review ratings, two decimal places.
    pub rating: Decimal,
    pub total_sessions: u32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile fields a compare-and-swap may change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentorPatch {
    pub bio: Option<String>,
    pub expertise: Option<Vec<String>>,
    pub is_approved: Option<bool>,
}

impl MentorPatch {
    pub fn is_empty(&self) -> bool {
        self.bio.is_none() && self.expertise.is_none() && self.is_approved.is_none()
    }
}

// ── Availability ─────────────────────────────────────────────────

/// When a slot applies. A slot is either weekly or tied to one date, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotSchedule {
    Recurring { weekday: Weekday },
    Specific { date: NaiveDate },
}

impl SlotSchedule {
    pub fn kind(&self) -> SlotKind {
        match self {
            SlotSchedule::Recurring { .. } => SlotKind::Recurring,
            SlotSchedule::Specific { .. } => SlotKind::Specific,
        }
    }

    pub fn applies_on(&self, date: NaiveDate) -> bool {
        match self {
            SlotSchedule::Recurring { weekday } => date.weekday() == *weekday,
            SlotSchedule::Specific { date: d } => *d == date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SlotKind {
    Recurring,
    Specific,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub id: Ulid,
    pub mentor_id: Ulid,
    pub schedule: SlotSchedule,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// Cleared instead of deleting the row.
    pub is_active: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilitySlot {
    /// The slot's window on `date`, or `None` when it does not apply that day.
    pub fn span_on(&self, date: NaiveDate) -> Option<Span> {
        if !self.is_active || !self.schedule.applies_on(date) || self.end_time <= self.start_time {
            return None;
        }
        let start = date.and_time(self.start_time).and_utc();
        let end = date.and_time(self.end_time).and_utc();
        Some(Span::between(start, end))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub schedule: Option<SlotSchedule>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub is_active: Option<bool>,
}

// ── Booking ──────────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    CancelledByMentor,
    CancelledByMentee,
    Rejected,
    NoShow,
}

impl BookingStatus {
    /// Active bookings hold the mentor's time.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            BookingStatus::Cancelled
                | BookingStatus::CancelledByMentor
                | BookingStatus::CancelledByMentee
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReminderHorizon {
    DayAhead,
    HourAhead,
}

impl ReminderHorizon {
    /// Bookings starting in `[now + lo, now + hi)` are due for this reminder.
    pub fn window(self) -> (Duration, Duration) {
        match self {
            ReminderHorizon::DayAhead => (Duration::hours(23), Duration::hours(25)),
            ReminderHorizon::HourAhead => (Duration::minutes(55), Duration::minutes(95)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingLink {
    pub url: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: Option<String>,
    pub by: Role,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub mentor_id: Ulid,
    /// Member account of the mentee.
    pub mentee_id: Ulid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub topic: String,
    pub notes: Option<String>,
    pub mentee_goals: Option<String>,
    pub status: BookingStatus,
    pub meeting: Option<MeetingLink>,
    pub session_notes: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub rejection_reason: Option<String>,
    pub no_show_by: Option<Party>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub reminders_sent: Vec<ReminderHorizon>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.scheduled_at + Duration::minutes(i64::from(self.duration_minutes))
    }

    /// The occupied interval. `None` for a record with no usable duration.
    pub fn span(&self) -> Option<Span> {
        if self.duration_minutes == 0 {
            return None;
        }
        Some(Span::between(self.scheduled_at, self.ends_at()))
    }

    pub fn reminded(&self, horizon: ReminderHorizon) -> bool {
        self.reminders_sent.contains(&horizon)
    }
}

/// Fields needed to persist a new booking. Status starts at `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub mentor_id: Ulid,
    pub mentee_id: Ulid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub topic: String,
    pub notes: Option<String>,
    pub mentee_goals: Option<String>,
}

/// The restricted set of booking fields an update may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<u32>,
    pub topic: Option<String>,
    pub notes: Option<String>,
    pub meeting: Option<MeetingLink>,
    pub session_notes: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub rejection_reason: Option<String>,
    pub no_show_by: Option<Party>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
}

impl BookingPatch {
    pub fn moves_schedule(&self) -> bool {
        self.scheduled_at.is_some() || self.duration_minutes.is_some()
    }
}

/// List options shared by the per-mentor and per-mentee listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub limit: Option<usize>,
    /// Rows skipped after sorting, for paging.
    pub offset: usize,
}

// ── Review ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: Ulid,
    pub mentor_id: Ulid,
    pub mentee_id: Ulid,
    pub booking_id: Ulid,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Per-mentor state ─────────────────────────────────────────────

/// Everything owned by one mentor. Guarded as a unit, so every conditional
/// write on a row below happens under a single lock.
#[derive(Debug, Clone)]
pub struct MentorState {
    pub mentor: Mentor,
    /// Sorted by `scheduled_at`.
    pub bookings: Vec<Booking>,
    pub slots: Vec<AvailabilitySlot>,
    pub reviews: Vec<Review>,
}

impl MentorState {
    pub fn new(mentor: Mentor) -> Self {
        Self {
            mentor,
            bookings: Vec::new(),
            slots: Vec::new(),
            reviews: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Insert or replace a booking, keeping start order.
    pub fn upsert_booking(&mut self, booking: Booking) {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == booking.id) {
            self.bookings.remove(pos);
        }
        let pos = self
            .bookings
            .binary_search_by_key(&booking.scheduled_at, |b| b.scheduled_at)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Bookings whose start lies in `[from, until)`.
    pub fn starting_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.scheduled_at < from);
        let hi = self.bookings.partition_point(|b| b.scheduled_at < until);
        self.bookings[lo..hi.max(lo)].iter()
    }

    pub fn slot(&self, id: Ulid) -> Option<&AvailabilitySlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn upsert_slot(&mut self, slot: AvailabilitySlot) {
        match self.slots.iter_mut().find(|s| s.id == slot.id) {
            Some(existing) => *existing = slot,
            None => self.slots.push(slot),
        }
    }

    pub fn review_for(&self, booking_id: Ulid) -> Option<&Review> {
        self.reviews.iter().find(|r| r.booking_id == booking_id)
    }
}

/// The WAL record format: one full row image per write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MentorSaved(Mentor),
    SlotSaved(AvailabilitySlot),
    BookingSaved(Booking),
    ReviewAdded(Review),
    /// A booking's completion and the mentor's session count, committed together.
    SessionCompleted { booking: Booking, mentor: Mentor },
    /// A review, its copy on the booking and the mentor's new mean rating.
    FeedbackRecorded {
        review: Review,
        booking: Booking,
        mentor: Mentor,
    },
}

impl Event {
    pub fn mentor_id(&self) -> Ulid {
        match self {
            Event::MentorSaved(m) => m.id,
            Event::SlotSaved(s) => s.mentor_id,
            Event::BookingSaved(b) => b.mentor_id,
            Event::ReviewAdded(r) => r.mentor_id,
            Event::SessionCompleted { mentor, .. } | Event::FeedbackRecorded { mentor, .. } => {
                mentor.id
            }
        }
    }
}
