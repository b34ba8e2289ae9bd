use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{
    ConsumeOutcome, ConsumerError, ConsumerResult, DomainEvent, EventConsumer, EventPublisher,
    EventType,
};

use super::{decode_saga_ref, decode_sale, emit};
use crate::compensation::CompensationAction;
use crate::events::CompensationPayload;
use crate::resilience::{CircuitBreaker, INVENTORY_SERVICE, StepPolicy, retry_with_backoff};
use crate::services::InventoryService;

/// Reserves stock once payment went through and gives it back when the
/// sale is undone.
pub struct InventoryParticipant {
    inventory: Arc<dyn InventoryService>,
    publisher: Arc<dyn EventPublisher>,
    breaker: CircuitBreaker,
    policy: StepPolicy,
}

impl InventoryParticipant {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        publisher: Arc<dyn EventPublisher>,
        breaker: CircuitBreaker,
        policy: StepPolicy,
    ) -> Self {
        Self {
            inventory,
            publisher,
            breaker,
            policy,
        }
    }

    async fn reserve(&self, event: &DomainEvent) -> ConsumerResult {
        let sale = decode_sale(event)?.without_failure();
        if self
            .inventory
            .has_active_reservation(&sale.product_id, sale.saga_id)
            .await?
        {
            tracing::debug!(saga_id = %sale.saga_id, "reservation already held");
            return Ok(ConsumeOutcome::Duplicate);
        }

        let reserved = retry_with_backoff("reserve_stock", INVENTORY_SERVICE, &self.policy, &self.breaker, || {
            self.inventory
                .reserve_stock(&sale.product_id, sale.quantity, sale.saga_id)
        })
        .await;

        let (event_type, payload) = match reserved {
            Ok(reservation) => (
                EventType::InventoryReserved,
                sale.with_reservation_id(reservation.reservation_id),
            ),
            Err(e) => {
                tracing::warn!(saga_id = %sale.saga_id, error = %e, "stock unavailable");
                let retryable = e.is_transient();
                (
                    EventType::InventoryUnavailable,
                    sale.with_failure(e.to_string(), retryable),
                )
            }
        };
        emit(self.publisher.as_ref(), event_type, event, &payload, INVENTORY_SERVICE).await
    }

    async fn release(&self, event: &DomainEvent) -> ConsumerResult {
        let saga_id = decode_saga_ref(event)?.saga_id;
        let released = retry_with_backoff("release_stock", INVENTORY_SERVICE, &self.policy, &self.breaker, || {
            self.inventory.release_reservation(saga_id)
        })
        .await?;
        if released.is_empty() {
            return Ok(ConsumeOutcome::Duplicate);
        }

        let payload = CompensationPayload {
            saga_id,
            action: CompensationAction::ReleaseStock.as_str().to_string(),
            references: released,
        };
        let notice = DomainEvent::builder(EventType::InventoryReleased)
            .aggregate_id(saga_id)
            .caused_by(event)
            .payload(&payload)
            .and_then(|b| b.source(INVENTORY_SERVICE).build())
            .map_err(|e| ConsumerError::Rejected(e.to_string()))?;
        self.publisher
            .publish(&notice)
            .await
            .map_err(|e| ConsumerError::Transient(e.to_string()))?;
        tracing::info!(%saga_id, references = ?payload.references, "stock released");
        Ok(ConsumeOutcome::Processed)
    }
}

#[async_trait]
impl EventConsumer for InventoryParticipant {
    fn name(&self) -> &str {
        "inventory-participant"
    }

    fn supported_types(&self) -> Vec<EventType> {
        vec![
            EventType::PaymentProcessed,
            EventType::PaymentFailed,
            EventType::PaymentRefunded,
            EventType::TransactionCancelled,
        ]
    }

    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, correlation_id = %event.correlation_id))]
    async fn process(&self, event: &DomainEvent) -> ConsumerResult {
        match event.event_type {
            EventType::PaymentProcessed => self.reserve(event).await,
            _ => self.release(event).await,
        }
    }
}
