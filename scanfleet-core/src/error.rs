use thiserror::Error;

use crate::job::JobStatus;
use crate::types::JobId;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("State conflict: job {job_id} cannot move from {current} to {requested}")]
    StateConflict {
        job_id: JobId,
        current: JobStatus,
        requested: JobStatus,
    },

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Queue writes surface broker failures as dispatch failures so callers can retry `start`.
    pub(crate) fn into_dispatch(self) -> Self {
        match self {
            Self::Broker(message) => Self::Dispatch(message),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
