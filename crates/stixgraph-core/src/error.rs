//! Core error type

/// Errors raised by the object model
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("invalid STIX identifier: {0}")]
    ParseId(String),

    #[error("unknown object type: {0}")]
    UnknownType(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type GraphResult<T> = Result<T, GraphError>;
