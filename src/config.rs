//! Layered runtime configuration.
//!
//! Sources, later overriding earlier:
//! 1. the defaults embedded below
//! 2. `mentorbook.toml` in the working directory, or an explicit file
//! 3. environment variables such as `MENTORBOOK__STORAGE__DATA_DIR`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::limits::*;

const DEFAULTS: &str = r#"
[storage]
data_dir = "./data"
compact_threshold = 1000
compact_interval_secs = 60

[booking]
min_duration_minutes = 30
max_duration_minutes = 120
default_duration_minutes = 60
max_advance_days = 90
lock_timeout_ms = 5000
lock_bucket_minutes = 60

[notifications]
queue_capacity = 1024
max_attempts = 3
retry_backoff_secs = 60
concurrency = 4

[reminders]
day_ahead_every_secs = 3600
hour_ahead_every_secs = 900
lock_prune_every_secs = 300

[breaker]
failure_threshold = 3
open_timeout = 30
half_open_max_calls = 1

[cache]
ttl_secs = 300

[logging]
level = "info"
format = "pretty"
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub booking: BookingPolicy,
    pub notifications: NotificationConfig,
    pub reminders: ReminderConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub compact_interval_secs: u64,
}

impl StorageConfig {
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("mentorbook.wal")
    }
}

/// Business rules applied when a booking is requested or moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BookingPolicy {
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
    pub default_duration_minutes: u32,
    pub max_advance_days: i64,
    pub lock_timeout_ms: u64,
    pub lock_bucket_minutes: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            min_duration_minutes: MIN_SESSION_MINUTES,
            max_duration_minutes: MAX_SESSION_MINUTES,
            default_duration_minutes: DEFAULT_SESSION_MINUTES,
            max_advance_days: MAX_ADVANCE_DAYS,
            lock_timeout_ms: 5000,
            lock_bucket_minutes: LOCK_BUCKET_MINUTES,
        }
    }
}

impl BookingPolicy {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    /// Deliveries in flight at once.
    pub concurrency: usize,
}

impl NotificationConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    pub day_ahead_every_secs: u64,
    pub hour_ahead_every_secs: u64,
    pub lock_prune_every_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus listener port. Disabled when unset.
    pub port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load from defaults, a config file and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml));
        let builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("mentorbook").required(false)),
        };
        let cfg: Self = builder
            .add_source(config::Environment::with_prefix("MENTORBOOK").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Embedded defaults plus `key = value` overrides, no file or environment.
    pub fn load_with_overrides(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml));
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }
        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let b = &self.booking;
        if b.min_duration_minutes == 0 || b.min_duration_minutes > b.max_duration_minutes {
            return Err(ConfigValidationError::InvalidValue(
                "booking.min_duration_minutes must be positive and not exceed max_duration_minutes".into(),
            ));
        }
        if !(b.min_duration_minutes..=b.max_duration_minutes).contains(&b.default_duration_minutes) {
            return Err(ConfigValidationError::InvalidValue(
                "booking.default_duration_minutes must lie within the min/max durations".into(),
            ));
        }
        if b.max_duration_minutes > MAX_SESSION_MINUTES {
            return Err(ConfigValidationError::InvalidValue(format!(
                "booking.max_duration_minutes cannot exceed {MAX_SESSION_MINUTES}"
            )));
        }
        if b.max_advance_days <= 0 {
            return Err(ConfigValidationError::InvalidValue(
                "booking.max_advance_days must be positive".into(),
            ));
        }
        if b.lock_bucket_minutes == 0 || 1440 % b.lock_bucket_minutes != 0 {
            return Err(ConfigValidationError::InvalidValue(
                "booking.lock_bucket_minutes must divide a day".into(),
            ));
        }
        if self.notifications.queue_capacity == 0 || self.notifications.concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "notifications.queue_capacity and notifications.concurrency must be positive".into(),
            ));
        }
        if self.notifications.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "notifications.max_attempts must be at least 1".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_max_calls == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "breaker thresholds must be positive".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue(format!(
                "logging.format must be json or pretty, got {}",
                self.logging.format
            )));
        }
        Ok(())
    }
}
