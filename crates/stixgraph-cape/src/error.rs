//! Mapping errors

/// Document-fatal mapping failures
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("not a valid CAPE report: {0}")]
    InvalidReport(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

pub type MappingResult<T> = Result<T, MappingError>;
