//! Saga state machines and the records they govern.
//!
//! This crate holds the pure, storage-agnostic part of saga coordination:
//! - [`StateGraph`] and the [`can_transition`] / [`transition`] gate
//! - [`SagaState`] and [`SagaExecution`] for the orchestrated sale
//! - [`ChoreographedSagaStatus`] and [`ChoreographedSagaState`] for the
//!   event-driven sale
//!
//! Status fields are only ever written through the gate, so a record's
//! history always follows a declared edge.

pub mod choreography;
pub mod error;
pub mod execution;
pub mod machine;
pub mod state;

pub use choreography::{
    ChoreographedSagaState, ChoreographedSagaStatus, ChoreographyStep, SALE_SAGA_TYPE,
};
pub use error::{DomainError, Result};
pub use execution::{SagaExecution, SagaStep, validate_sale};
pub use machine::{StateGraph, Transitionable, can_transition, next_timestamp, transition};
pub use state::SagaState;
