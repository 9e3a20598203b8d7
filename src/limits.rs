// Booking rules.
pub const MIN_SESSION_MINUTES: u32 = 30;
pub const MAX_SESSION_MINUTES: u32 = 120;
pub const DEFAULT_SESSION_MINUTES: u32 = 60;
pub const MAX_ADVANCE_DAYS: i64 = 90;
pub const MAX_NOTES_LEN: usize = 2000;

// Availability slots.
pub const MIN_SLOT_MINUTES: i64 = 30;
pub const MAX_SLOT_MINUTES: i64 = 180;
pub const MAX_BULK_SLOTS: usize = 100;

// Mentor profiles.
pub const MAX_BIO_LEN: usize = 2000;
pub const MAX_EXPERTISE_TAGS: usize = 20;

/// Width of the advisory lock bucket. Requests whose start falls in the same
/// bucket for the same mentor and day contend for one lock.
pub const LOCK_BUCKET_MINUTES: u32 = 60;

// Resource caps.
pub const MAX_BOOKINGS_PER_MENTOR: usize = 100_000;
pub const MAX_SLOTS_PER_MENTOR: usize = 1_000;
pub const MAX_LIST_LIMIT: usize = 500;
