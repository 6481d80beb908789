use std::path::PathBuf;

use thiserror::Error;

use crate::model::RunId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("run {run_id} not found")]
    RunNotFound { run_id: RunId },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
