//! Daemon-level error types.

use crate::storage::StorageError;
use crate::stream::StreamError;
use thiserror::Error;

/// Result type for daemon lifecycle operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Failures that abort startup or a lifecycle operation. Per-event failures
/// inside the consumer never surface here; they are logged and persisted as
/// result rows instead.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("model error: {0}")]
    Model(String),

    #[error("llm client error: {0}")]
    Llm(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("server error: {0}")]
    Server(String),
}
