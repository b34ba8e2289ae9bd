//! Saga error types.

use std::time::Duration;

use audit::AuditError;
use common::{EventId, SagaId};
use domain::DomainError;
use event_bus::{BusError, ConsumerError};
use saga_store::StoreError;
use thiserror::Error;

/// Coarse classification used for retry decisions and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request; never retried.
    Validation,
    /// Unknown saga or resource.
    NotFound,
    /// Timeout, unavailable collaborator or open circuit.
    TransientDependency,
    /// Illegal transition or optimistic concurrency conflict.
    StateConflict,
    /// Event id seen before.
    DuplicateEvent,
    /// Message that can never be processed.
    PoisonMessage,
    /// A collaborator refused the request on business grounds.
    BusinessRejected,
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Saga not found: {0}")]
    NotFound(String),

    /// A collaborator refused the request (insufficient stock, declined payment).
    #[error("{service} rejected the request: {reason}")]
    BusinessRejected {
        service: &'static str,
        reason: String,
    },

    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    #[error("{service} did not answer within {timeout:?}")]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },

    #[error("Circuit open for {service}")]
    CircuitOpen { service: String },

    #[error("{step} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Compensation '{action}' failed: {reason}")]
    CompensationFailed { action: String, reason: String },

    #[error("Duplicate event: {0}")]
    DuplicateEvent(EventId),

    #[error("Saga {0} is already being processed")]
    AlreadyStarted(SagaId),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::Validation(_) => ErrorKind::Validation,
            SagaError::NotFound(_) => ErrorKind::NotFound,
            SagaError::BusinessRejected { .. } => ErrorKind::BusinessRejected,
            SagaError::Unavailable { .. }
            | SagaError::Timeout { .. }
            | SagaError::CircuitOpen { .. }
            | SagaError::RetriesExhausted { .. }
            | SagaError::CompensationFailed { .. } => ErrorKind::TransientDependency,
            SagaError::DuplicateEvent(_)
            | SagaError::Domain(DomainError::EventAlreadyApplied { .. })
            | SagaError::Store(StoreError::Domain(DomainError::EventAlreadyApplied { .. })) => {
                ErrorKind::DuplicateEvent
            }
            SagaError::AlreadyStarted(_) => ErrorKind::StateConflict,
            SagaError::Domain(DomainError::Validation(_)) => ErrorKind::Validation,
            SagaError::Domain(_) => ErrorKind::StateConflict,
            SagaError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            SagaError::Store(StoreError::Domain(DomainError::Validation(_))) => {
                ErrorKind::Validation
            }
            SagaError::Store(
                StoreError::ConcurrencyConflict { .. }
                | StoreError::AlreadyExists(_)
                | StoreError::Domain(_),
            ) => ErrorKind::StateConflict,
            SagaError::Store(StoreError::Serialization(_) | StoreError::Corrupt(_)) => {
                ErrorKind::PoisonMessage
            }
            SagaError::Store(_) => ErrorKind::TransientDependency,
            SagaError::Bus(BusError::InvalidEnvelope(_) | BusError::Serialization(_)) => {
                ErrorKind::PoisonMessage
            }
            SagaError::Bus(_) => ErrorKind::TransientDependency,
            SagaError::Serialization(_) => ErrorKind::PoisonMessage,
            SagaError::Audit(_) => ErrorKind::TransientDependency,
        }
    }

    /// True if trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientDependency
    }

    /// True when a record was asked to compensate outside `COMPENSATING`.
    pub fn is_compensation_not_required(&self) -> bool {
        matches!(self, SagaError::Domain(DomainError::CompensationNotRequired(_)))
    }

    pub(crate) fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        SagaError::Unavailable {
            service,
            reason: reason.into(),
        }
    }

    pub(crate) fn rejected(service: &'static str, reason: impl Into<String>) -> Self {
        SagaError::BusinessRejected {
            service,
            reason: reason.into(),
        }
    }
}

/// Maps a handler failure onto the bus's redelivery decision.
///
/// Domain rule violations and unprocessable input are rejected outright;
/// everything else is redelivered.
impl From<SagaError> for ConsumerError {
    fn from(error: SagaError) -> Self {
        match &error {
            SagaError::Domain(_) | SagaError::Store(StoreError::Domain(_)) => {
                ConsumerError::Rejected(error.to_string())
            }
            _ => match error.kind() {
                ErrorKind::Validation | ErrorKind::PoisonMessage | ErrorKind::BusinessRejected => {
                    ConsumerError::Rejected(error.to_string())
                }
                _ => ConsumerError::Transient(error.to_string()),
            },
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::Version;

    #[test]
    fn kinds() {
        assert_eq!(
            SagaError::rejected("payment-service", "declined").kind(),
            ErrorKind::BusinessRejected
        );
        assert!(SagaError::unavailable("order-service", "503").is_transient());
        assert!(
            SagaError::CircuitOpen {
                service: "payment-service".into()
            }
            .is_transient()
        );
        let conflict = SagaError::Store(StoreError::ConcurrencyConflict {
            saga_id: SagaId::new(),
            expected: Version::first(),
            actual: Version::new(2),
        });
        assert_eq!(conflict.kind(), ErrorKind::StateConflict);
        assert_eq!(
            SagaError::Domain(DomainError::Validation("qty".into())).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SagaError::Bus(BusError::InvalidEnvelope("x".into())).kind(),
            ErrorKind::PoisonMessage
        );
        let reapplied = SagaError::Store(StoreError::Domain(DomainError::EventAlreadyApplied {
            saga_id: SagaId::new(),
            event_id: EventId::new(),
        }));
        assert_eq!(reapplied.kind(), ErrorKind::DuplicateEvent);
    }

    #[test]
    fn consumer_error_mapping() {
        let transient: ConsumerError = SagaError::unavailable("payment-service", "503").into();
        assert!(matches!(transient, ConsumerError::Transient(_)));

        let rejected: ConsumerError =
            SagaError::Domain(DomainError::CompensationNotRequired(SagaId::new())).into();
        assert!(matches!(rejected, ConsumerError::Rejected(_)));

        let malformed: ConsumerError = SagaError::Validation("missing sagaId".into()).into();
        assert!(matches!(malformed, ConsumerError::Rejected(_)));
    }
}
