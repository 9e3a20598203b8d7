//! Email content for booking notifications.

use std::fmt::Write;

use ulid::Ulid;

use crate::model::{Booking, BookingStatus, Party, ReminderHorizon};
use crate::notify::{Contact, Notification, NotificationKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub booking_id: Ulid,
    pub to: String,
    pub subject: String,
    pub body: String,
}

const BOTH: &[Party] = &[Party::Mentor, Party::Mentee];
const MENTEE: &[Party] = &[Party::Mentee];
const MENTOR: &[Party] = &[Party::Mentor];

/// Who hears about a notification.
pub fn recipients(kind: &NotificationKind) -> &'static [Party] {
    match kind {
        NotificationKind::Created
        | NotificationKind::Rescheduled { .. }
        | NotificationKind::Reminder { .. } => BOTH,
        NotificationKind::StatusChanged { new, .. } => match new {
            BookingStatus::Confirmed
            | BookingStatus::Rejected
            | BookingStatus::Completed
            | BookingStatus::CancelledByMentor
            | BookingStatus::NoShow => MENTEE,
            BookingStatus::CancelledByMentee => MENTOR,
            BookingStatus::Cancelled => BOTH,
            BookingStatus::Pending => &[],
        },
    }
}

fn session_date(b: &Booking) -> String {
    b.scheduled_at.format("%B %d, %Y").to_string()
}

fn session_time(b: &Booking) -> String {
    format!(
        "{} - {} UTC",
        b.scheduled_at.format("%I:%M %p"),
        b.ends_at().format("%I:%M %p")
    )
}

fn subject(kind: &NotificationKind, party: Party, b: &Booking) -> String {
    let date = session_date(b);
    match kind {
        NotificationKind::Created => match party {
            Party::Mentor => format!("New Mentorship Request - {date}"),
            Party::Mentee => format!("Mentorship Request Sent - {date}"),
        },
        NotificationKind::Rescheduled { .. } => format!("Session Rescheduled - {date}"),
        NotificationKind::Reminder { horizon: ReminderHorizon::DayAhead } => {
            format!("Reminder: Mentorship Session Tomorrow - {date}")
        }
        NotificationKind::Reminder { horizon: ReminderHorizon::HourAhead } => {
            format!("Reminder: Mentorship Session in One Hour - {date}")
        }
        NotificationKind::StatusChanged { new, .. } => match new {
            BookingStatus::Confirmed => format!("Session Confirmed - {date}"),
            BookingStatus::Rejected => format!("Session Request Declined - {date}"),
            BookingStatus::Completed => format!("Session Completed - Thank You! - {date}"),
            BookingStatus::CancelledByMentee => format!("Session Cancelled by Mentee - {date}"),
            BookingStatus::Cancelled | BookingStatus::CancelledByMentor => {
                format!("Session Cancelled - {date}")
            }
            BookingStatus::NoShow => format!("Missed Session - {date}"),
            BookingStatus::Pending => format!("Session Update - {date}"),
        },
    }
}

fn headline(kind: &NotificationKind, party: Party) -> &'static str {
    match kind {
        NotificationKind::Created => match party {
            Party::Mentor => "You have a new mentorship session request.",
            Party::Mentee => "Your session request was sent. Your mentor will confirm it shortly.",
        },
        NotificationKind::Rescheduled { .. } => "A mentorship session has been moved and awaits confirmation.",
        NotificationKind::Reminder { .. } => "This is a reminder about your upcoming mentorship session.",
        NotificationKind::StatusChanged { new, .. } => match new {
            BookingStatus::Confirmed => "Your mentorship session has been confirmed!",
            BookingStatus::Rejected => "Unfortunately your mentor could not take this session.",
            BookingStatus::Completed => "Thank you for attending. You can now leave feedback for your mentor.",
            BookingStatus::CancelledByMentee => "Your mentee has cancelled this session.",
            BookingStatus::CancelledByMentor => "Your mentor has cancelled this session.",
            BookingStatus::Cancelled => "This session has been cancelled.",
            BookingStatus::NoShow => "This session was marked as missed.",
            BookingStatus::Pending => "Your session is awaiting confirmation.",
        },
    }
}

pub fn render(notification: &Notification, party: Party, contact: &Contact) -> EmailMessage {
    let b = &notification.booking;
    let mut body = String::new();
    let _ = writeln!(body, "Hello {},", contact.name);
    let _ = writeln!(body);
    let _ = writeln!(body, "{}", headline(&notification.kind, party));
    let _ = writeln!(body);
    let _ = writeln!(body, "Session Details:");
    let _ = writeln!(body, "- Topic: {}", b.topic);
    let _ = writeln!(body, "- Date: {}", session_date(b));
    let _ = writeln!(body, "- Time: {}", session_time(b));
    let _ = writeln!(body, "- Status: {}", b.status);

    if let NotificationKind::Rescheduled { previous_start, .. } = &notification.kind {
        let _ = writeln!(body, "- Previously: {}", previous_start.format("%B %d, %Y %I:%M %p UTC"));
    }
    if let Some(link) = &b.meeting {
        let _ = writeln!(body, "- Meeting link ({}): {}", link.platform, link.url);
    }
    if let Some(reason) = &b.rejection_reason {
        let _ = writeln!(body, "- Reason: {reason}");
    }
    if let Some(reason) = b.cancellation.as_ref().and_then(|c| c.reason.as_ref()) {
        let _ = writeln!(body, "- Reason: {reason}");
    }
    if party == Party::Mentor {
        if let Some(goals) = &b.mentee_goals {
            let _ = writeln!(body, "- Mentee goals: {goals}");
        }
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "Best regards,");
    let _ = write!(body, "The Mentorship Team");

    EmailMessage {
        booking_id: b.id,
        to: contact.email.clone(),
        subject: subject(&notification.kind, party, b),
        body,
    }
}
