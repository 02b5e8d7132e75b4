//! Conversion errors

use std::path::PathBuf;
use stixgraph_cape::MappingError;
use stixgraph_store::StoreError;

/// Errors raised while converting one document or running a batch
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("input path not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("lookup failed: {0}")]
    Lookup(String),
}

pub type ConversionResult<T> = Result<T, ConversionError>;

impl ConversionError {
    /// Usage errors abort a run; everything else is isolated per document
    pub fn is_usage_error(&self) -> bool {
        matches!(self, ConversionError::Config(_) | ConversionError::InputNotFound(_))
    }

    /// Short label for per-document log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ConversionError::Mapping(_) => "invalid report",
            ConversionError::Store(_) => "store",
            ConversionError::Io(_) => "io",
            ConversionError::Json(_) => "json",
            ConversionError::Config(_) => "config",
            ConversionError::InputNotFound(_) => "input",
            ConversionError::Lookup(_) => "lookup",
        }
    }
}
