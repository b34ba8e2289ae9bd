//! The event-driven sale.
//!
//! No central coordinator: each participant reacts to the previous
//! participant's event and publishes its own outcome.
//!
//! ```text
//! TransactionCreated ──► payment ──► PaymentProcessed ──► inventory ──► InventoryReserved ──► fulfillment ──► OrderFulfilled
//!                           │                                │                                   │
//!                           ▼                                ▼                                   ▼
//!                     PaymentFailed                 InventoryUnavailable              OrderFulfillmentFailed
//! ```
//!
//! The [`SagaTracker`] follows every step of a correlation id, retries a
//! failed first step, and hands partially completed sales to compensation.

pub mod fulfillment;
pub mod inventory;
pub mod payment;
pub mod tracker;

use std::sync::Arc;

use chrono::Duration;
use common::SagaId;
use event_bus::topology::{FULFILLMENT_QUEUE, INVENTORY_QUEUE, PAYMENT_QUEUE, SAGA_TRACKER_QUEUE};
use event_bus::{
    ConsumeOutcome, ConsumerError, ConsumerResult, DomainEvent, EventPublisher, EventType,
    InMemoryEventBus,
};
use saga_store::ChoreographyRepository;
use serde::Deserialize;

pub use fulfillment::FulfillmentParticipant;
pub use inventory::InventoryParticipant;
pub use payment::PaymentParticipant;
pub use tracker::SagaTracker;

use crate::compensation::CompensationCoordinator;
use crate::error::Result;
use crate::events::{self, SalePayload};
use crate::orchestrator::SaleRequest;
use crate::resilience::{ServiceBreakers, StepPolicy};
use crate::services::SaleServices;

/// Tunables for the event-driven sale.
#[derive(Debug, Clone)]
pub struct ChoreographyConfig {
    /// Time a sale may stay open before the monitor steps in.
    pub saga_timeout: Duration,
    /// Re-attempts of a failed first step.
    pub max_retries: u32,
    /// Applied to each participant's collaborator call.
    pub step_policy: StepPolicy,
}

impl Default for ChoreographyConfig {
    fn default() -> Self {
        Self {
            saga_timeout: Duration::minutes(30),
            max_retries: 3,
            step_policy: StepPolicy::default(),
        }
    }
}

impl ChoreographyConfig {
    pub fn with_saga_timeout(mut self, timeout: Duration) -> Self {
        self.saga_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_step_policy(mut self, policy: StepPolicy) -> Self {
        self.step_policy = policy;
        self
    }
}

/// Identifiers of a sale that was handed to the participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSale {
    pub saga_id: SagaId,
    pub correlation_id: String,
}

/// Opens an event-driven sale by publishing `TransactionCreated`.
#[tracing::instrument(skip(publisher, request), fields(customer_id = %request.customer_id))]
pub async fn start_sale(publisher: &dyn EventPublisher, request: &SaleRequest) -> Result<StartedSale> {
    request.validate()?;
    let saga_id = SagaId::new();
    let correlation_id = saga_id.correlation_id();
    let payload = SalePayload::new(
        saga_id,
        request.customer_id.clone(),
        request.product_id.clone(),
        request.quantity,
        request.amount,
    );
    let event = events::transaction_created(&payload, &correlation_id, None)?;
    publisher.publish(&event).await?;
    tracing::info!(%saga_id, %correlation_id, "choreographed sale started");
    metrics::counter!("saga_choreography_started_total").increment(1);
    Ok(StartedSale {
        saga_id,
        correlation_id,
    })
}

/// The four consumers of the event-driven sale, wired to one set of
/// collaborators.
#[derive(Clone)]
pub struct SaleChoreography {
    pub payment: Arc<PaymentParticipant>,
    pub inventory: Arc<InventoryParticipant>,
    pub fulfillment: Arc<FulfillmentParticipant>,
    pub tracker: Arc<SagaTracker>,
}

impl SaleChoreography {
    pub fn new(
        services: &SaleServices,
        publisher: Arc<dyn EventPublisher>,
        repository: Arc<dyn ChoreographyRepository>,
        compensation: CompensationCoordinator,
        breakers: &ServiceBreakers,
        config: ChoreographyConfig,
    ) -> Self {
        Self {
            payment: Arc::new(PaymentParticipant::new(
                Arc::clone(&services.payment),
                Arc::clone(&publisher),
                breakers.payment.clone(),
                config.step_policy.clone(),
            )),
            inventory: Arc::new(InventoryParticipant::new(
                Arc::clone(&services.inventory),
                Arc::clone(&publisher),
                breakers.inventory.clone(),
                config.step_policy.clone(),
            )),
            fulfillment: Arc::new(FulfillmentParticipant::new(
                Arc::clone(&services.order),
                Arc::clone(&publisher),
                breakers.order.clone(),
                config.step_policy.clone(),
            )),
            tracker: Arc::new(SagaTracker::new(repository, compensation, publisher, config)),
        }
    }

    /// Subscribes each participant to its queue of the sale topology.
    pub fn subscribe(&self, bus: &InMemoryEventBus) -> event_bus::Result<()> {
        bus.subscribe(PAYMENT_QUEUE, self.payment.clone())?;
        bus.subscribe(INVENTORY_QUEUE, self.inventory.clone())?;
        bus.subscribe(FULFILLMENT_QUEUE, self.fulfillment.clone())?;
        bus.subscribe(SAGA_TRACKER_QUEUE, self.tracker.clone())?;
        Ok(())
    }
}

/// Just the saga id, for payloads of any shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SagaRef {
    pub saga_id: SagaId,
}

pub(crate) fn decode_sale(event: &DomainEvent) -> std::result::Result<SalePayload, ConsumerError> {
    event
        .payload_as::<SalePayload>()
        .map_err(|e| ConsumerError::Rejected(format!("malformed sale payload: {e}")))
}

pub(crate) fn decode_saga_ref(event: &DomainEvent) -> std::result::Result<SagaRef, ConsumerError> {
    event
        .payload_as::<SagaRef>()
        .map_err(|e| ConsumerError::Rejected(format!("payload without sagaId: {e}")))
}

/// Publishes the participant's reaction to `cause`.
pub(crate) async fn emit(
    publisher: &dyn EventPublisher,
    event_type: EventType,
    cause: &DomainEvent,
    payload: &SalePayload,
    source: &str,
) -> ConsumerResult {
    let event = events::follow_up(event_type, cause, payload, source)?;
    publisher
        .publish(&event)
        .await
        .map_err(|e| ConsumerError::Transient(e.to_string()))?;
    tracing::debug!(
        event_type = %event.event_type,
        correlation_id = %event.correlation_id,
        source,
        "participant published"
    );
    Ok(ConsumeOutcome::Processed)
}
