use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("{}", match .0 {
        Some(id) => format!("slot unavailable: conflicts with booking {id}"),
        None => "slot unavailable".to_string(),
    })]
    Conflict(Option<Ulid>),
    #[error("version conflict on {id}: expected {expected}, found {actual}; refresh and retry")]
    VersionConflict { id: Ulid, expected: u64, actual: u64 },
    #[error("not authorized: {0}")]
    Unauthorized(&'static str),
    #[error("cannot {action} a booking that is {from}")]
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    #[error("feedback already submitted for booking {0}")]
    FeedbackAlreadySubmitted(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("timed out waiting for booking lock {0}")]
    LockTimeout(i64),
    #[error("temporarily unavailable: {0}")]
    Unavailable(&'static str),
}

impl EngineError {
    /// Storage and lock failures a caller may retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::WalError(_) | EngineError::LockTimeout(_) | EngineError::Unavailable(_)
        )
    }

    /// The HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => 400,
            EngineError::Unauthorized(_) => 403,
            EngineError::NotFound(_) => 404,
            EngineError::AlreadyExists(_)
            | EngineError::Conflict(_)
            | EngineError::VersionConflict { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::FeedbackAlreadySubmitted(_) => 409,
            EngineError::WalError(_) | EngineError::LockTimeout(_) | EngineError::Unavailable(_) => {
                503
            }
        }
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(e: validator::ValidationErrors) -> Self {
        EngineError::Validation(e.to_string())
    }
}
