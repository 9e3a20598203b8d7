//! Named mutual exclusion around "check for conflicts, then insert".
//!
//! A [`LockKey`] names one mentor, one date and one time bucket. It maps to a
//! 31-bit integer the way a database advisory lock would be addressed, and the
//! in-process [`AdvisoryLocks`] gate serializes holders of the same integer.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::engine::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub mentor_id: Ulid,
    pub date: NaiveDate,
    /// Index of the `bucket_minutes`-wide bucket the start falls in.
    pub bucket: u32,
}

impl LockKey {
    pub fn for_start(mentor_id: Ulid, start: DateTime<Utc>, bucket_minutes: u32) -> Self {
        let minute_of_day = start.hour() * 60 + start.minute();
        Self {
            mentor_id,
            date: start.date_naive(),
            bucket: minute_of_day / bucket_minutes.max(1),
        }
    }

    /// Deterministic id in `[0, 2^31)`. Distinct keys may collide; that only
    /// serializes more than necessary.
    pub fn lock_id(&self) -> i64 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.mentor_id.to_bytes());
        hasher.update(&self.date.num_days_from_ce().to_le_bytes());
        hasher.update(&self.bucket.to_le_bytes());
        i64::from(hasher.finalize() & 0x7fff_ffff)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.mentor_id, self.date, self.bucket)
    }
}

/// Held until dropped; every exit path releases it.
pub struct LockGuard {
    key: LockKey,
    lock_id: i64,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    pub fn new(key: LockKey, held: Box<dyn Send + Sync>) -> Self {
        Self {
            key,
            lock_id: key.lock_id(),
            _held: held,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::trace!(lock_id = self.lock_id, key = %self.key, "lock released");
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("lock_id", &self.lock_id)
            .finish()
    }
}

#[async_trait]
pub trait LockGate: Send + Sync {
    /// Wait for the lock named by `key`. Fails with `LockTimeout` rather than
    /// waiting forever.
    async fn acquire(&self, key: LockKey) -> Result<LockGuard, EngineError>;
}

/// Run `critical` while holding `key`'s lock.
pub async fn with_lock<G, F, T>(gate: &G, key: LockKey, critical: F) -> Result<T, EngineError>
where
    G: LockGate + ?Sized,
    F: Future<Output = Result<T, EngineError>>,
{
    let _guard = gate.acquire(key).await?;
    critical.await
}

/// In-process advisory locks keyed by lock id.
pub struct AdvisoryLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl AdvisoryLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Lock ids with an entry, held or not.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }
}

#[async_trait]
impl LockGate for AdvisoryLocks {
    async fn acquire(&self, key: LockKey) -> Result<LockGuard, EngineError> {
        let lock_id = key.lock_id();
        let mutex = self.locks.entry(lock_id).or_default().clone();
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(held) => {
                metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                tracing::trace!(lock_id, key = %key, "lock acquired");
                Ok(LockGuard::new(key, Box::new(held)))
            }
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(lock_id, key = %key, timeout_ms = self.timeout.as_millis() as u64, "lock wait timed out");
                Err(EngineError::LockTimeout(lock_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::at;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn key_buckets_by_start() {
        let mid = Ulid::new();
        let a = LockKey::for_start(mid, at(2025, 6, 1, 10, 0), 60);
        let b = LockKey::for_start(mid, at(2025, 6, 1, 10, 45), 60);
        let c = LockKey::for_start(mid, at(2025, 6, 1, 11, 0), 60);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.bucket, 10);
        assert_eq!(LockKey::for_start(mid, at(2025, 6, 1, 10, 45), 30).bucket, 21);
    }

    #[test]
    fn lock_id_is_deterministic_and_31_bit() {
        let mid = Ulid::new();
        let key = LockKey::for_start(mid, at(2025, 6, 1, 10, 0), 60);
        assert_eq!(key.lock_id(), key.lock_id());
        assert_eq!(key.lock_id(), LockKey::for_start(mid, at(2025, 6, 1, 10, 59), 60).lock_id());
        for h in 0..24 {
            let id = LockKey::for_start(mid, at(2025, 6, 1, h, 0), 60).lock_id();
            assert!((0..1 << 31).contains(&id));
        }
        let other_day = LockKey::for_start(mid, at(2025, 6, 2, 10, 0), 60);
        assert_ne!(key.lock_id(), other_day.lock_id());
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(AdvisoryLocks::new(Duration::from_secs(5)));
        let key = LockKey::for_start(Ulid::new(), at(2025, 6, 1, 10, 0), 60);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(key).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiting_too_long_times_out() {
        let locks = AdvisoryLocks::new(Duration::from_millis(20));
        let key = LockKey::for_start(Ulid::new(), at(2025, 6, 1, 10, 0), 60);
        let _held = locks.acquire(key).await.unwrap();
        let err = locks.acquire(key).await.unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout(id) if id == key.lock_id()));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let locks = AdvisoryLocks::new(Duration::from_millis(50));
        let key = LockKey::for_start(Ulid::new(), at(2025, 6, 1, 10, 0), 60);
        let r: Result<(), _> = with_lock(&locks, key, async { Err(EngineError::Conflict(None)) }).await;
        assert!(matches!(r, Err(EngineError::Conflict(None))));
        // Released, so this does not time out.
        let v = with_lock(&locks, key, async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = AdvisoryLocks::new(Duration::from_secs(1));
        let mid = Ulid::new();
        let held_key = LockKey::for_start(mid, at(2025, 6, 1, 10, 0), 60);
        let idle_key = LockKey::for_start(mid, at(2025, 6, 1, 14, 0), 60);
        let _held = locks.acquire(held_key).await.unwrap();
        drop(locks.acquire(idle_key).await.unwrap());
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.prune_idle(), 1);
        assert_eq!(locks.len(), 1);
    }
}
