//! Store error type

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("graph error: {0}")]
    Graph(#[from] stixgraph_core::GraphError),

    #[error("benign corpus error in {path}: {message}")]
    Corpus { path: PathBuf, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
