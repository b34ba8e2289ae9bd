//! API error types with HTTP response mapping.

use audit::AuditError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::{ErrorKind, SagaError};
use saga_store::StoreError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga operation error, mapped by its kind.
    Saga(SagaError),
    /// Audit trail unavailable or corrupt.
    Audit(AuditError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Audit(AuditError::InvalidQuery(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Audit(err) => {
                tracing::error!(error = %err, "audit query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match err.kind() {
        ErrorKind::Validation | ErrorKind::BusinessRejected => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StateConflict => StatusCode::CONFLICT,
        ErrorKind::TransientDependency | ErrorKind::DuplicateEvent | ErrorKind::PoisonMessage => {
            tracing::error!(error = %err, "saga operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        ApiError::Audit(err)
    }
}

/// Failures while wiring the server together.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Saga store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("Audit store setup failed: {0}")]
    Audit(#[from] AuditError),

    #[error("Event bus setup failed: {0}")]
    Bus(#[from] event_bus::BusError),

    #[error("Metrics recorder setup failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
