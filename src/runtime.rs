use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::booking::BookingService;
use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::Config;
use crate::engine::Engine;
use crate::lock::AdvisoryLocks;
use crate::mentor::MentorService;
use crate::model::ReminderHorizon;
use crate::notify::{Directory, Mailer, NotificationDispatcher, NotificationWorker, RetryPolicy};
use crate::reaper;
use crate::repo::StoreHandles;

/// Every long-lived piece of a running service, wired from one [`Config`].
pub struct Runtime {
    pub engine: Arc<Engine>,
    pub bookings: Arc<BookingService>,
    pub mentors: Arc<MentorService>,
    pub dispatcher: NotificationDispatcher,
    pub locks: Arc<AdvisoryLocks>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Replay the WAL and spawn the notification worker, both reminder
    /// sweeps, housekeeping and the compactor. Must run inside a Tokio runtime.
    pub fn start(
        config: &Config,
        clock: Arc<dyn Clock>,
        mailer: Arc<dyn Mailer>,
        directory: Arc<dyn Directory>,
    ) -> anyhow::Result<Self> {
        let wal_path = config.storage.wal_path();
        let engine = Arc::new(
            Engine::new(wal_path.clone(), clock.clone(), config.breaker)
                .with_context(|| format!("opening WAL at {}", wal_path.display()))?,
        );
        let stores = StoreHandles::shared(engine.clone());
        let locks = Arc::new(AdvisoryLocks::new(config.booking.lock_timeout()));

        let (dispatcher, rx) = NotificationDispatcher::channel(config.notifications.queue_capacity);
        let mail_breaker = Arc::new(CircuitBreaker::new("mail", config.breaker, clock.clone()));
        let worker = NotificationWorker::new(
            rx,
            mailer,
            directory,
            RetryPolicy {
                max_attempts: config.notifications.max_attempts,
                backoff: config.notifications.retry_backoff(),
            },
            config.notifications.concurrency,
            mail_breaker,
        );

        let bookings = Arc::new(BookingService::new(
            stores.clone(),
            locks.clone(),
            dispatcher.clone(),
            clock.clone(),
            config.booking,
        ));
        let mentors = Arc::new(MentorService::new(
            stores.clone(),
            clock.clone(),
            Duration::from_secs(config.cache.ttl_secs),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reminders = &config.reminders;
        let tasks = vec![
            tokio::spawn(worker.run(shutdown_rx.clone())),
            tokio::spawn(reaper::run_reminders(
                stores.bookings.clone(),
                dispatcher.clone(),
                clock.clone(),
                ReminderHorizon::DayAhead,
                Duration::from_secs(reminders.day_ahead_every_secs),
                shutdown_rx.clone(),
            )),
            tokio::spawn(reaper::run_reminders(
                stores.bookings.clone(),
                dispatcher.clone(),
                clock,
                ReminderHorizon::HourAhead,
                Duration::from_secs(reminders.hour_ahead_every_secs),
                shutdown_rx.clone(),
            )),
            tokio::spawn(reaper::run_housekeeping(
                locks.clone(),
                dispatcher.clone(),
                mentors.clone(),
                Duration::from_secs(reminders.lock_prune_every_secs),
                shutdown_rx.clone(),
            )),
            tokio::spawn(reaper::run_compactor(
                engine.clone(),
                config.storage.compact_threshold,
                Duration::from_secs(config.storage.compact_interval_secs),
                shutdown_rx,
            )),
        ];

        tracing::info!(
            wal = %wal_path.display(),
            mentors = engine.mentor_count(),
            "mentorbook runtime started"
        );
        Ok(Self {
            engine,
            bookings,
            mentors,
            dispatcher,
            locks,
            shutdown,
            tasks,
        })
    }

    /// Signal every background task and wait up to `grace` for them to drain.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let pending = self.tasks.len();
        let drained = tokio::time::timeout(grace, futures::future::join_all(self.tasks)).await;
        match drained {
            Ok(results) => {
                for r in results.into_iter().filter_map(Result::err) {
                    tracing::error!(error = %r, "background task panicked");
                }
                tracing::info!("all background tasks stopped");
            }
            Err(_) => tracing::warn!(pending, "shutdown grace elapsed with tasks still running"),
        }
    }
}
