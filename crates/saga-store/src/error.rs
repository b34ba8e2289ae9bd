use common::{SagaId, Version};
use domain::DomainError;
use thiserror::Error;

/// Errors that can occur when reading or writing saga records.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record was modified since it was read.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// A record with the same key already exists.
    #[error("Saga record already exists: {0}")]
    AlreadyExists(String),

    /// No record exists for the saga.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A mutation applied during a modify loop was rejected.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored column held a value the domain does not recognise.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
