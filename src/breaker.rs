use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use strum::{AsRefStr, Display};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial call.
    #[serde(with = "serde_secs")]
    pub open_timeout: Duration,
    /// Trial calls admitted while half-open; this many successes close it again.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_calls: u32,
    half_open_successes: u32,
}

/// Closed/open/half-open breaker around a flaky dependency.
///
/// Time only enters through the injected [`Clock`], so every transition can be
/// driven from a test without sleeping.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_calls: 0,
                half_open_successes: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask for permission to make one call. Moves open → half-open once the
    /// open timeout has elapsed.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let Some(opened_at) = inner.opened_at else {
                    return false;
                };
                let elapsed = self.clock.now() - opened_at;
                if elapsed.to_std().is_ok_and(|e| e >= self.config.open_timeout) {
                    tracing::info!(breaker = self.name, "circuit half-open, admitting trial calls");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    tracing::info!(breaker = self.name, "circuit closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };
        if trip {
            self.open(&mut inner, now);
        }
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        tracing::warn!(
            breaker = self.name,
            failures = inner.consecutive_failures,
            "circuit opened"
        );
        metrics::counter!(crate::observability::BREAKER_OPENED_TOTAL, "breaker" => self.name)
            .increment(1);
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.half_open_calls = 0;
        inner.half_open_successes = 0;
    }

    /// An admitted call went away without an outcome. A lost half-open trial
    /// reopens the breaker so a later call can try again; a lost call while
    /// closed says nothing about the dependency.
    fn abandon(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            tracing::debug!(breaker = self.name, "half-open trial call abandoned");
            self.open(&mut inner, now);
        }
    }

    /// Run `operation` if the breaker allows it, recording the outcome.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call_counting(operation, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which `counts` returns
    /// true are failures. Any other outcome shows the dependency answered and
    /// is recorded as a success.
    pub async fn call_counting<F, T, E, P>(&self, operation: F, counts: P) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open);
        }
        let mut admitted = Admitted {
            breaker: self,
            settled: false,
        };
        let result = operation.await;
        admitted.settled = true;
        match &result {
            Err(e) if counts(e) => self.record_failure(),
            _ => self.record_success(),
        }
        result.map_err(BreakerError::Inner)
    }
}

/// Held across an admitted call. Dropped unsettled when the caller's future
/// is cancelled mid-call.
struct Admitted<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon();
        }
    }
}

/// Durations in config files are plain seconds.
pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
