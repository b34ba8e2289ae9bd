use thiserror::Error;

/// Errors raised while recording or querying the audit trail.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row held a value that cannot be decoded.
    #[error("Corrupt audit row: {0}")]
    Corrupt(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The audit store cannot accept writes right now.
    #[error("Audit store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
