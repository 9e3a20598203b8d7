use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::{Booking, BookingStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BookingCounts {
    pub total: usize,
    pub by_status: BTreeMap<BookingStatus, usize>,
    /// Active bookings that have not started yet.
    pub upcoming: usize,
}

impl BookingCounts {
    pub fn of(&self, status: BookingStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

pub fn summarize<'a>(bookings: impl IntoIterator<Item = &'a Booking>, now: DateTime<Utc>) -> BookingCounts {
    let mut counts = BookingCounts::default();
    for b in bookings {
        counts.total += 1;
        *counts.by_status.entry(b.status).or_default() += 1;
        if b.status.is_active() && b.scheduled_at > now {
            counts.upcoming += 1;
        }
    }
    counts
}

/// Mean rating rounded to two places; zero with no ratings.
pub fn mean_rating(ratings: &[u8]) -> Decimal {
    if ratings.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = ratings.iter().map(|&r| Decimal::from(r)).sum();
    (sum / Decimal::from(ratings.len())).round_dp(2)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MentorStats {
    pub bookings: BookingCounts,
    pub total_sessions: u32,
    pub rating: Decimal,
    pub review_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenteeStats {
    pub bookings: BookingCounts,
    pub reviews_given: usize,
}

/// One page of a mentee's completed sessions, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHistory {
    pub sessions: Vec<Booking>,
    /// Completed sessions across every page.
    pub count: usize,
    pub page: usize,
    pub page_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{at, booking};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn mean_is_rounded_to_cents() {
        assert_eq!(mean_rating(&[5, 4, 3]), dec("4.00"));
        assert_eq!(mean_rating(&[5, 4, 4]), dec("4.33"));
        assert_eq!(mean_rating(&[5, 5, 4]), dec("4.67"));
        assert_eq!(mean_rating(&[]), Decimal::ZERO);
    }

    #[test]
    fn counts_by_status_and_upcoming() {
        let mid = ulid::Ulid::new();
        let mut done = booking(mid, at(2025, 5, 1, 10, 0), 60);
        done.status = BookingStatus::Completed;
        let mut confirmed = booking(mid, at(2025, 6, 3, 10, 0), 60);
        confirmed.status = BookingStatus::Confirmed;
        let pending = booking(mid, at(2025, 6, 4, 10, 0), 60);
        let stale_pending = booking(mid, at(2025, 5, 2, 10, 0), 60);

        let counts = summarize([&done, &confirmed, &pending, &stale_pending], at(2025, 6, 1, 0, 0));
        assert_eq!(counts.total, 4);
        assert_eq!(counts.of(BookingStatus::Pending), 2);
        assert_eq!(counts.of(BookingStatus::Completed), 1);
        assert_eq!(counts.of(BookingStatus::NoShow), 0);
        assert_eq!(counts.upcoming, 2);
    }
}
