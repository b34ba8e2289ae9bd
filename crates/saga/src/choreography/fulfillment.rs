use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{ConsumerResult, DomainEvent, EventConsumer, EventPublisher, EventType};

use super::{decode_sale, emit};
use crate::events::order_fulfillment_failed;
use crate::resilience::{CircuitBreaker, ORDER_SERVICE, StepPolicy, retry_with_backoff};
use crate::services::OrderService;

/// Confirms the order once stock is held.
pub struct FulfillmentParticipant {
    order: Arc<dyn OrderService>,
    publisher: Arc<dyn EventPublisher>,
    breaker: CircuitBreaker,
    policy: StepPolicy,
}

impl FulfillmentParticipant {
    pub fn new(
        order: Arc<dyn OrderService>,
        publisher: Arc<dyn EventPublisher>,
        breaker: CircuitBreaker,
        policy: StepPolicy,
    ) -> Self {
        Self {
            order,
            publisher,
            breaker,
            policy,
        }
    }
}

#[async_trait]
impl EventConsumer for FulfillmentParticipant {
    fn name(&self) -> &str {
        "fulfillment-participant"
    }

    fn supported_types(&self) -> Vec<EventType> {
        vec![EventType::InventoryReserved]
    }

    #[tracing::instrument(skip(self, event), fields(correlation_id = %event.correlation_id))]
    async fn process(&self, event: &DomainEvent) -> ConsumerResult {
        let sale = decode_sale(event)?.without_failure();
        let confirmed = retry_with_backoff("confirm_order", ORDER_SERVICE, &self.policy, &self.breaker, || {
            self.order.confirm_order(
                sale.saga_id,
                &sale.customer_id,
                &sale.product_id,
                sale.quantity,
                sale.amount_cents,
            )
        })
        .await;

        let (event_type, payload) = match confirmed {
            Ok(confirmation) => (
                EventType::OrderFulfilled,
                sale.with_order_id(confirmation.order_id),
            ),
            Err(e) => {
                tracing::warn!(saga_id = %sale.saga_id, error = %e, "order could not be confirmed");
                let retryable = e.is_transient();
                (order_fulfillment_failed(), sale.with_failure(e.to_string(), retryable))
            }
        };
        emit(self.publisher.as_ref(), event_type, event, &payload, ORDER_SERVICE).await
    }
}
