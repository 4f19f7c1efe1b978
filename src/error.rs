//! Error taxonomy for the pipeline stores and the orchestration flow.
//!
//! Only genuine faults live here. Outcomes that are expected in steady
//! state (duplicate admission, empty queue, unknown id on a status update,
//! a research session below threshold) are plain result values defined in
//! [`crate::models`] so callers branch on them instead of catching errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The underlying SQLite store failed. Fatal to the calling operation;
    /// no retry is attempted at the store layer.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("research session '{0}' not found")]
    SessionNotFound(String),

    #[error("research session '{0}' has no logged steps")]
    NoStepsLogged(String),

    #[error("research session '{0}' is not completed")]
    NotCompleted(String),

    #[error("research session '{0}' is completed and accepts no further steps")]
    SessionClosed(String),

    #[error("research session '{research_id}' belongs to discovery '{expected}', not '{found}'")]
    ResearchMismatch {
        research_id: String,
        expected: String,
        found: String,
    },

    #[error("snapshot version {found} is newer than supported version {supported}")]
    UnsupportedSnapshot { found: u32, supported: u32 },

    #[error("invalid discovery: {0}")]
    InvalidDiscovery(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
