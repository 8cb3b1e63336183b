//! Error kinds for the synchronization engine (spec §7).

use thiserror::Error;

/// A single offending `{model, pk, columns}` entry carried by
/// [`SyncError::UniqueConstraint`].
#[derive(Debug, Clone)]
pub struct UniqueConflict {
    pub model_name: String,
    pub pk: i64,
    pub columns: Vec<String>,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "http")]
    #[error("network: {0}")]
    Network(#[from] reqwest::Error),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("bad response from server: {0}")]
    BadResponse(String),

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("pull suggested: {0}")]
    PullSuggested(String),

    #[error("unique constraint conflict(s) couldn't be resolved automatically: {0:?}")]
    UniqueConstraint(Vec<UniqueConflict>),

    #[error("operation error: {0}")]
    Operation(String),

    #[error("engine used before set_engine/configure")]
    Configuration,

    #[error("value error: {0}")]
    Value(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("invalid state: {0}")]
    State(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;
