//! Shared error type

use thiserror::Error;

/// Errors shared across the pipeline crates
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("model deadline exceeded")]
    Deadline,
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
