mod availability;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{carve, coalesce, open_windows, validate_slot_times};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

use store::Indexes;

pub type SharedMentorState = Arc<RwLock<MentorState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL flush failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The system of record: every mentor with its slots, bookings and reviews,
/// rebuilt from the WAL on start.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedMentorState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) indexes: Indexes,
    pub(super) clock: Arc<dyn Clock>,
    /// Serializes profile creation (one profile per account) with compaction.
    pub(super) profile_lock: tokio::sync::Mutex<()>,
    breaker: CircuitBreaker,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        clock: Arc<dyn Clock>,
        breaker: BreakerConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let indexes = Indexes::default();
        let mut replayed: HashMap<Ulid, MentorState> = HashMap::new();
        let mut orphans = 0usize;
        for event in &events {
            match event {
                Event::MentorSaved(mentor) => match replayed.get_mut(&mentor.id) {
                    Some(ms) => store::apply_event(ms, event, &indexes),
                    None => {
                        let mut ms = MentorState::new(mentor.clone());
                        store::apply_event(&mut ms, event, &indexes);
                        replayed.insert(mentor.id, ms);
                    }
                },
                other => match replayed.get_mut(&other.mentor_id()) {
                    Some(ms) => store::apply_event(ms, other, &indexes),
                    None => orphans += 1,
                },
            }
        }
        if orphans > 0 {
            tracing::warn!(orphans, "WAL events referenced unknown mentors and were skipped");
        }

        let state = DashMap::new();
        for (id, ms) in replayed {
            state.insert(id, Arc::new(RwLock::new(ms)));
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            mentors = state.len(),
            "engine state restored"
        );

        Ok(Self {
            state,
            wal_tx,
            indexes,
            profile_lock: tokio::sync::Mutex::new(()),
            breaker: CircuitBreaker::new("storage", breaker, clock.clone()),
            clock,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let submit = async {
            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::Append {
                    event: event.clone(),
                    response: tx,
                })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::WalError(e.to_string()))
        };
        match self.breaker.call(submit).await {
            Ok(()) => Ok(()),
            Err(BreakerError::Open) => Err(EngineError::Unavailable("storage circuit open")),
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    pub fn get_mentor_state(&self, id: &Ulid) -> Option<SharedMentorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_mentor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.indexes.entity_to_mentor.get(entity_id).map(|e| *e.value())
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// WAL-append then apply, under the caller's write guard.
    pub(super) async fn persist_and_apply(
        &self,
        ms: &mut MentorState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        store::apply_event(ms, &event, &self.indexes);
        Ok(())
    }

    /// Lookup entity → mentor, get mentor state, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<MentorState>, EngineError> {
        let mentor_id = self
            .get_mentor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ms = self
            .get_mentor_state(&mentor_id)
            .ok_or(EngineError::NotFound(mentor_id))?;
        Ok(ms.write_owned().await)
    }

    pub(super) async fn resolve_entity_read(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<MentorState>, EngineError> {
        let mentor_id = self
            .get_mentor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ms = self
            .get_mentor_state(&mentor_id)
            .ok_or(EngineError::NotFound(mentor_id))?;
        Ok(ms.read_owned().await)
    }

    pub(super) fn mentor_state(&self, id: Ulid) -> Result<SharedMentorState, EngineError> {
        self.get_mentor_state(&id).ok_or(EngineError::NotFound(id))
    }
}
