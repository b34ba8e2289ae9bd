//! Sale saga coordination.
//!
//! A retail sale touches three collaborators (inventory, payment, order)
//! that cannot share a transaction. This crate keeps them consistent in two
//! interchangeable styles:
//!
//! - [`SagaOrchestrator`] drives the steps itself:
//!   verify stock, reserve stock, process payment, confirm the order.
//! - [`SaleChoreography`] lets each collaborator react to the previous one's
//!   event while a [`SagaTracker`] follows the correlation id.
//!
//! Either way a failure after partial progress is undone by the
//! [`CompensationCoordinator`], and the [`TimeoutMonitor`] resolves sales
//! that stopped moving. Collaborator calls go through per-service circuit
//! breakers and bounded retry.

pub mod choreography;
pub mod compensation;
pub mod error;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod resilience;
pub mod services;

pub use choreography::{
    ChoreographyConfig, FulfillmentParticipant, InventoryParticipant, PaymentParticipant,
    SaleChoreography, SagaTracker, StartedSale, start_sale,
};
pub use compensation::{
    CompensationAction, CompensationCoordinator, CompensationPlan, CompensationReport,
};
pub use error::{ErrorKind, Result, SagaError};
pub use events::{CompensationPayload, SalePayload};
pub use monitor::{
    MonitorConfig, RetentionConfig, RetentionReport, RetentionSweeper, SweepReport, TimeoutMonitor,
};
pub use orchestrator::{OrchestratorConfig, SagaOrchestrator, SaleOutcome, SaleRequest};
pub use resilience::{
    BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, ServiceBreakers, StepPolicy,
};
pub use services::{
    InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService, InventoryService,
    OrderService, PaymentService, SaleServices,
};
