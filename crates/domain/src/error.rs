//! Domain error types.

use common::{EventId, SagaId};
use thiserror::Error;

/// Errors raised by state machine and record invariants.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The requested transition is not an edge of the state graph.
    #[error("Illegal transition from {from} to {to}")]
    StateConflict { from: String, to: String },

    /// The record is in a terminal state and cannot be mutated.
    #[error("Saga {saga_id} is terminal ({state}) and cannot be modified")]
    TerminalRecord { saga_id: SagaId, state: String },

    /// Compensation was completed on a saga that never required it.
    #[error("Saga {0} was not flagged for compensation")]
    CompensationNotRequired(SagaId),

    /// The event was already applied to the record.
    #[error("Event {event_id} was already applied to saga {saga_id}")]
    EventAlreadyApplied { saga_id: SagaId, event_id: EventId },

    /// A record was constructed from invalid input.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
