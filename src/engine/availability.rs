use chrono::{NaiveDate, NaiveTime};

use crate::limits::{MAX_SLOT_MINUTES, MIN_SLOT_MINUTES};
use crate::model::*;

use super::EngineError;

/// A slot must end after it starts and last between the minimum and maximum
/// slot length.
pub fn validate_slot_times(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if end <= start {
        return Err(EngineError::Validation("end time must be after start time".into()));
    }
    let minutes = (end - start).num_minutes();
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&minutes) {
        return Err(EngineError::Validation(format!(
            "slot length must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// Bookable windows on `date`: the union of active slots that apply that day
/// minus every active booking.
pub fn open_windows(slots: &[AvailabilitySlot], bookings: &[Booking], date: NaiveDate) -> Vec<Span> {
    let mut offered: Vec<Span> = slots.iter().filter_map(|s| s.span_on(date)).collect();
    offered.sort_by_key(|s| s.start);
    let offered = coalesce(&offered);

    let mut taken: Vec<Span> = bookings
        .iter()
        .filter(|b| b.status.is_active())
        .filter_map(Booking::span)
        .collect();
    if taken.is_empty() {
        return offered;
    }
    taken.sort_by_key(|s| s.start);
    carve(&offered, &coalesce(&taken))
}

/// Collapse spans sorted by start into disjoint spans. Touching spans join.
pub fn coalesce(sorted: &[Span]) -> Vec<Span> {
    sorted.iter().fold(Vec::with_capacity(sorted.len()), |mut out: Vec<Span>, &next| {
        match out.last_mut() {
            Some(prev) if next.start <= prev.end => prev.end = prev.end.max(next.end),
            _ => out.push(next),
        }
        out
    })
}

/// Remove `holes` from `spans`. Both inputs are disjoint and sorted by start.
pub fn carve(spans: &[Span], holes: &[Span]) -> Vec<Span> {
    let mut free = Vec::new();
    let mut holes = holes.iter().peekable();
    for span in spans {
        let mut cursor = span.start;
        // Holes ending before this span can't touch any later span either.
        while holes.next_if(|h| h.end <= cursor).is_some() {}
        for hole in holes.clone().take_while(|h| h.start < span.end) {
            if hole.start > cursor {
                free.push(Span::new(cursor, hole.start));
            }
            cursor = cursor.max(hole.end);
        }
        if cursor < span.end {
            free.push(Span::new(cursor, span.end));
        }
    }
    free
}
