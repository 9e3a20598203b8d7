pub mod booking;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod limits;
pub mod lock;
pub mod mentor;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod repo;
pub mod runtime;
pub mod templates;
pub mod wal;
