//! Persistence gateway: typed operations over the alerts and analysis
//! tables, behind a trait with a Postgres implementation for production and
//! an in-memory implementation for tests.

mod memory;
mod model;
mod postgres;
mod traits;

pub use memory::InMemoryStore;
pub use model::{
    AlertRecord, AnalysisRecord, LastAnalysis, ANALYSIS_TYPE_ANOMALY, ANALYSIS_TYPE_DUPLICATE,
    ANALYSIS_TYPE_LLM,
};
pub use postgres::PgStore;
pub use traits::AnalysisStore;

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound(err.to_string()),
            other => StorageError::Backend(other.to_string()),
        }
    }
}
