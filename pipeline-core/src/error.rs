use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide error type.
///
/// Only [`PipelineError::AlreadyQueued`] and
/// [`PipelineError::NotFound`] are expected to cross the [`crate::queue::Queue`]
/// public contract as validation errors. Every other variant is logged at the
/// call site and converted into item state, a counter, or a log line — it
/// never propagates further up the stack.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("already queued: {0}")]
    AlreadyQueued(PathBuf),

    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("watcher error: {0}")]
    Watch(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
