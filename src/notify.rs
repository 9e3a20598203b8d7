//! Fire-and-forget booking notifications.
//!
//! Callers hand a [`Notification`] to the [`NotificationDispatcher`], which never
//! blocks and never fails. A burst past the queue's capacity waits in spawned
//! tasks instead of being dropped. A [`NotificationWorker`] drains the queue, renders
//! emails and delivers them with bounded, fixed-backoff retries. Every
//! notification is also published on a per-account broadcast feed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use ulid::Ulid;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::model::{Booking, BookingStatus, Party, ReminderHorizon};
use crate::templates::{self, EmailMessage};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Created,
    StatusChanged { old: BookingStatus, new: BookingStatus },
    Rescheduled { old: BookingStatus, previous_start: DateTime<Utc> },
    Reminder { horizon: ReminderHorizon },
}

impl NotificationKind {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::Created => "created",
            NotificationKind::StatusChanged { .. } => "status_changed",
            NotificationKind::Rescheduled { .. } => "rescheduled",
            NotificationKind::Reminder { .. } => "reminder",
        }
    }
}

/// A job for the worker: what happened, plus the booking as it was afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub booking: Booking,
}

impl Notification {
    pub fn booking_id(&self) -> Ulid {
        self.booking.id
    }
}

/// Broadcast hub keyed by account (mentor profile or mentee account).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for an account. Creates the channel if needed.
    pub fn subscribe(&self, account_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(account_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, account_id: Ulid, notification: &Notification) {
        if let Some(sender) = self.channels.get(&account_id) {
            let _ = sender.send(notification.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune_closed(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the notification queue. Cheap to clone.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<Notification>,
    hub: Arc<NotifyHub>,
}

impl NotificationDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                hub: Arc::new(NotifyHub::new()),
            },
            rx,
        )
    }

    pub fn hub(&self) -> &Arc<NotifyHub> {
        &self.hub
    }

    /// Live feed of notifications touching `account_id`.
    pub fn subscribe(&self, account_id: Ulid) -> broadcast::Receiver<Notification> {
        self.hub.subscribe(account_id)
    }

    /// Queue without waiting. When the queue is full the job is handed to a
    /// task that waits for room; only a closed queue drops it. The caller's
    /// operation is unaffected either way.
    pub fn enqueue(&self, notification: Notification) {
        self.hub.send(notification.booking.mentor_id, &notification);
        self.hub.send(notification.booking.mentee_id, &notification);

        let kind = notification.kind.label();
        let booking_id = notification.booking_id();
        match self.tx.try_send(notification) {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_ENQUEUED_TOTAL, "kind" => kind)
                    .increment(1);
                tracing::debug!(%booking_id, kind, "notification queued");
            }
            Err(mpsc::error::TrySendError::Full(notification)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_ENQUEUED_TOTAL, "kind" => kind)
                    .increment(1);
                tracing::debug!(%booking_id, kind, "notification queue full, deferring");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(notification).await.is_err() {
                        metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL)
                            .increment(1);
                        tracing::warn!(%booking_id, kind, "notification dropped, queue closed");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                tracing::warn!(%booking_id, kind, "notification dropped, queue closed");
            }
        }
    }

    pub fn notify_created(&self, booking: &Booking) {
        self.enqueue(Notification {
            kind: NotificationKind::Created,
            booking: booking.clone(),
        });
    }

    pub fn notify_status_changed(&self, booking: &Booking, old: BookingStatus, new: BookingStatus) {
        self.enqueue(Notification {
            kind: NotificationKind::StatusChanged { old, new },
            booking: booking.clone(),
        });
    }

    /// The booking's new status is carried on `booking`.
    pub fn notify_rescheduled(&self, booking: &Booking, old: BookingStatus, previous_start: DateTime<Utc>) {
        self.enqueue(Notification {
            kind: NotificationKind::Rescheduled { old, previous_start },
            booking: booking.clone(),
        });
    }

    pub fn notify_reminder(&self, booking: &Booking, horizon: ReminderHorizon) {
        self.enqueue(Notification {
            kind: NotificationKind::Reminder { horizon },
            booking: booking.clone(),
        });
    }
}

// ── Delivery ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub email: String,
}

/// Resolves booking parties to mail recipients.
#[async_trait]
pub trait Directory: Send + Sync {
    /// `id` is the mentor profile id for [`Party::Mentor`] and the member
    /// account id for [`Party::Mentee`].
    async fn lookup(&self, party: Party, id: Ulid) -> Option<Contact>;
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Worth retrying: timeouts, connection resets, 4xx-style deferrals.
    #[error("transient mail failure: {0}")]
    Transient(String),
    /// Retrying cannot help: bad address, rejected content.
    #[error("permanent mail failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        tracing::info!(to = %message.to, subject = %message.subject, booking_id = %message.booking_id, "email");
        Ok(())
    }
}

/// In-memory directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    contacts: DashMap<Ulid, Contact>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Ulid, contact: Contact) {
        self.contacts.insert(id, contact);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(&self, _party: Party, id: Ulid) -> Option<Contact> {
        self.contacts.get(&id).map(|c| c.value().clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

struct Delivery {
    mailer: Arc<dyn Mailer>,
    directory: Arc<dyn Directory>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

/// Consumer side of the queue.
pub struct NotificationWorker {
    rx: mpsc::Receiver<Notification>,
    delivery: Arc<Delivery>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl NotificationWorker {
    pub fn new(
        rx: mpsc::Receiver<Notification>,
        mailer: Arc<dyn Mailer>,
        directory: Arc<dyn Directory>,
        retry: RetryPolicy,
        concurrency: usize,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            rx,
            delivery: Arc::new(Delivery {
                mailer,
                directory,
                retry,
                breaker,
            }),
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// Deliver until the queue closes or `shutdown` flips. On shutdown the
    /// already-queued jobs are still delivered before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(notification) => self.spawn_delivery(notification).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.rx.close();
                    while let Some(notification) = self.rx.recv().await {
                        self.spawn_delivery(notification).await;
                    }
                    break;
                }
            }
        }
        // Wait for in-flight deliveries.
        let _ = self.permits.acquire_many(self.concurrency as u32).await;
        tracing::debug!("notification worker stopped");
    }

    async fn spawn_delivery(&self, notification: Notification) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let delivery = self.delivery.clone();
        tokio::spawn(async move {
            let _permit = permit;
            delivery.deliver(notification).await;
        });
    }
}

impl Delivery {
    async fn deliver(&self, notification: Notification) {
        for &party in templates::recipients(&notification.kind) {
            let id = match party {
                Party::Mentor => notification.booking.mentor_id,
                Party::Mentee => notification.booking.mentee_id,
            };
            let Some(contact) = self.directory.lookup(party, id).await else {
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                tracing::warn!(
                    booking_id = %notification.booking_id(),
                    party = %party,
                    "no contact for recipient, dropping email"
                );
                continue;
            };
            let message = templates::render(&notification, party, &contact);
            self.send_with_retry(&message).await;
        }
    }

    async fn send_with_retry(&self, message: &EmailMessage) {
        let max = self.retry.max_attempts.max(1);
        for attempt in 1..=max {
            // A bounced address says nothing about the mail service's health.
            let outcome = self
                .breaker
                .call_counting(self.mailer.send(message), |e| {
                    matches!(e, MailError::Transient(_))
                })
                .await;
            let reason = match outcome {
                Ok(()) => {
                    metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL).increment(1);
                    tracing::debug!(booking_id = %message.booking_id, to = %message.to, attempt, "email sent");
                    return;
                }
                Err(BreakerError::Inner(MailError::Permanent(reason))) => {
                    metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                    tracing::warn!(booking_id = %message.booking_id, to = %message.to, %reason, "email rejected permanently");
                    return;
                }
                Err(BreakerError::Inner(MailError::Transient(reason))) => reason,
                Err(BreakerError::Open) => "mail circuit open".to_string(),
            };
            if attempt == max {
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                tracing::error!(booking_id = %message.booking_id, to = %message.to, attempts = max, %reason, "email undeliverable");
                return;
            }
            tracing::info!(booking_id = %message.booking_id, attempt, %reason, "email failed, retrying");
            tokio::time::sleep(self.retry.backoff).await;
        }
    }
}
