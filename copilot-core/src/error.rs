//! Error taxonomy shared by every incident operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IncidentError {
    /// Required input missing or malformed. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation against an incident id that does not exist.
    #[error("incident not found: {id}")]
    NotFound { id: String },

    /// Inference or transcription call failed.
    #[error("service error: {0}")]
    Service(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Persisted data that violates an invariant (bad enum text, missing step output).
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl IncidentError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Only external service failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Service(_))
    }
}

impl From<figment::Error> for IncidentError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

pub type Result<T, E = IncidentError> = std::result::Result<T, E>;
