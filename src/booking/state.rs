//! Which actor may do what to a booking, and where it leads.
//!
//! ```text
//! pending ──confirm──▶ confirmed ──complete──▶ completed
//!    │                    │  └────no_show───▶ no_show
//!    ├──reject──▶ rejected │
//!    └──cancel────────────┴──▶ cancelled | cancelled_by_mentor | cancelled_by_mentee
//! pending/confirmed ──reschedule──▶ pending (new time)
//! ```

use chrono::{NaiveDate, NaiveTime};
use strum::IntoStaticStr;

use crate::engine::EngineError;
use crate::model::{Actor, Booking, BookingStatus, Party, Role};

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Confirm,
    Reject {
        reason: Option<String>,
    },
    Cancel {
        reason: Option<String>,
    },
    Complete {
        session_notes: Option<String>,
    },
    NoShow {
        party: Party,
    },
    /// Without `end_time` the session keeps its current length.
    Reschedule {
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: Option<NaiveTime>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// The role `actor` acts in for `action` on `booking`, or why it may not.
pub fn authorize(actor: &Actor, booking: &Booking, action: &Action) -> Result<Role, EngineError> {
    let party = actor.party_in(booking);
    match action {
        Action::Confirm | Action::Reject { .. } | Action::Complete { .. } | Action::NoShow { .. } => {
            match party {
                Some(Party::Mentor) => Ok(Role::Mentor),
                _ => Err(EngineError::Unauthorized("only the booking's mentor may do this")),
            }
        }
        Action::Cancel { .. } => match (party, actor) {
            (Some(party), _) => Ok(party.into()),
            (None, Actor::Admin) => Ok(Role::Admin),
            (None, _) => Err(EngineError::Unauthorized("only a party to the booking may cancel it")),
        },
        Action::Reschedule { .. } => party
            .map(Role::from)
            .ok_or(EngineError::Unauthorized("only a party to the booking may reschedule it")),
    }
}

/// Target status of `action` from `from`, performed as `role`.
pub fn next_status(from: BookingStatus, action: &Action, role: Role) -> Result<BookingStatus, EngineError> {
    use BookingStatus::*;
    let to = match (from, action) {
        (Pending, Action::Confirm) => Confirmed,
        (Pending, Action::Reject { .. }) => Rejected,
        (Pending | Confirmed, Action::Cancel { .. }) => match role {
            Role::Mentor => CancelledByMentor,
            Role::Mentee => CancelledByMentee,
            Role::Admin => Cancelled,
        },
        (Confirmed, Action::Complete { .. }) => Completed,
        (Confirmed, Action::NoShow { .. }) => NoShow,
        (Pending | Confirmed, Action::Reschedule { .. }) => Pending,
        _ => {
            return Err(EngineError::InvalidTransition {
                from,
                action: action.name(),
            })
        }
    };
    Ok(to)
}
