use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{ConsumerResult, DomainEvent, EventConsumer, EventPublisher, EventType};

use super::{decode_sale, emit};
use crate::resilience::{CircuitBreaker, PAYMENT_SERVICE, StepPolicy, retry_with_backoff};
use crate::services::PaymentService;

/// Charges the customer when a transaction is created.
pub struct PaymentParticipant {
    payment: Arc<dyn PaymentService>,
    publisher: Arc<dyn EventPublisher>,
    breaker: CircuitBreaker,
    policy: StepPolicy,
}

impl PaymentParticipant {
    pub fn new(
        payment: Arc<dyn PaymentService>,
        publisher: Arc<dyn EventPublisher>,
        breaker: CircuitBreaker,
        policy: StepPolicy,
    ) -> Self {
        Self {
            payment,
            publisher,
            breaker,
            policy,
        }
    }
}

#[async_trait]
impl EventConsumer for PaymentParticipant {
    fn name(&self) -> &str {
        "payment-participant"
    }

    fn supported_types(&self) -> Vec<EventType> {
        vec![EventType::TransactionCreated]
    }

    #[tracing::instrument(skip(self, event), fields(correlation_id = %event.correlation_id))]
    async fn process(&self, event: &DomainEvent) -> ConsumerResult {
        let sale = decode_sale(event)?.without_failure();
        let charged = retry_with_backoff("process_payment", PAYMENT_SERVICE, &self.policy, &self.breaker, || {
            self.payment
                .process_payment(&sale.customer_id, sale.amount_cents, sale.saga_id)
        })
        .await;

        let (event_type, payload) = match charged {
            Ok(receipt) => (
                EventType::PaymentProcessed,
                sale.with_transaction_id(receipt.transaction_id),
            ),
            Err(e) => {
                tracing::warn!(saga_id = %sale.saga_id, error = %e, "payment failed");
                let retryable = e.is_transient();
                (EventType::PaymentFailed, sale.with_failure(e.to_string(), retryable))
            }
        };
        emit(self.publisher.as_ref(), event_type, event, &payload, PAYMENT_SERVICE).await
    }
}
