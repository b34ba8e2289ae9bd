//! Payloads and envelope construction for the events the sale sagas emit.

use common::{EventId, Money, SagaId};
use domain::SagaExecution;
use event_bus::{DomainEvent, EventPublisher, EventType};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Aggregate type of the orchestrated sale events.
pub const SALE_AGGREGATE: &str = "Sale";

/// Event type a fulfillment participant emits when an order cannot be
/// confirmed. There is no dedicated variant, so it travels as
/// [`EventType::Other`].
pub const ORDER_FULFILLMENT_FAILED: &str = "OrderFulfillmentFailed";

pub const ORCHESTRATOR_SOURCE: &str = "saga-orchestrator";
pub const COMPENSATION_SOURCE: &str = "compensation-coordinator";
pub const TRACKER_SOURCE: &str = "saga-tracker";
pub const TRANSACTION_SOURCE: &str = "transaction-service";

pub fn order_fulfillment_failed() -> EventType {
    EventType::Other(ORDER_FULFILLMENT_FAILED.to_string())
}

/// Sale details carried by every sale event.
///
/// Participants copy the payload forward and fill in the identifiers they
/// produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePayload {
    pub saga_id: SagaId,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount_cents: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl SalePayload {
    pub fn new(
        saga_id: SagaId,
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
        amount: Money,
    ) -> Self {
        Self {
            saga_id,
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
            amount_cents: amount,
            state: None,
            reservation_id: None,
            transaction_id: None,
            order_id: None,
            reason: None,
            retryable: None,
        }
    }

    /// Snapshot of an orchestrated sale.
    pub fn from_execution(saga: &SagaExecution) -> Self {
        Self {
            state: Some(saga.state().to_string()),
            reservation_id: saga.reservation_id().map(String::from),
            transaction_id: saga.payment_transaction_id().map(String::from),
            order_id: saga.order_id().map(String::from),
            reason: saga.error_message().map(String::from),
            ..Self::new(
                saga.saga_id(),
                saga.customer_id(),
                saga.product_id(),
                saga.quantity(),
                saga.amount(),
            )
        }
    }

    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_reservation_id(mut self, id: impl Into<String>) -> Self {
        self.reservation_id = Some(id.into());
        self
    }

    pub fn with_order_id(mut self, id: impl Into<String>) -> Self {
        self.order_id = Some(id.into());
        self
    }

    pub fn with_failure(mut self, reason: impl Into<String>, retryable: bool) -> Self {
        self.reason = Some(reason.into());
        self.retryable = Some(retryable);
        self
    }

    /// Drops the failure fields, leaving the sale as it was requested.
    pub fn without_failure(mut self) -> Self {
        self.reason = None;
        self.retryable = None;
        self
    }
}

/// Payload of a compensating action's event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationPayload {
    pub saga_id: SagaId,
    pub action: String,
    pub references: Vec<String>,
}

/// Orchestrated sale event: aggregate `Sale`, correlation id = saga id.
pub(crate) fn sale_event(
    event_type: EventType,
    saga: &SagaExecution,
    cause: Option<EventId>,
) -> Result<DomainEvent> {
    Ok(DomainEvent::builder(event_type)
        .aggregate(SALE_AGGREGATE, saga.saga_id())
        .correlation_id(saga.saga_id().correlation_id())
        .causation_id(cause)
        .payload(&SalePayload::from_execution(saga))?
        .source(ORCHESTRATOR_SOURCE)
        .build()?)
}

fn emitter_of(event_type: &EventType) -> &'static str {
    match event_type.default_aggregate_type() {
        Some(aggregate_type) => aggregate_type,
        None if event_type.as_str() == ORDER_FULFILLMENT_FAILED => "Order",
        None => SALE_AGGREGATE,
    }
}

/// Event emitted in reaction to `cause`, continuing its causal chain.
pub(crate) fn follow_up(
    event_type: EventType,
    cause: &DomainEvent,
    payload: &SalePayload,
    source: &str,
) -> Result<DomainEvent> {
    let aggregate_type = emitter_of(&event_type);
    Ok(DomainEvent::builder(event_type)
        .aggregate(aggregate_type, payload.saga_id)
        .caused_by(cause)
        .payload(payload)?
        .source(source)
        .build()?)
}

/// Event that opens a choreographed sale.
pub(crate) fn transaction_created(
    payload: &SalePayload,
    correlation_id: &str,
    cause: Option<EventId>,
) -> Result<DomainEvent> {
    Ok(DomainEvent::builder(EventType::TransactionCreated)
        .aggregate_id(payload.saga_id)
        .correlation_id(correlation_id)
        .causation_id(cause)
        .payload(payload)?
        .source(TRANSACTION_SOURCE)
        .build()?)
}

pub(crate) fn compensation_event(
    event_type: EventType,
    correlation_id: &str,
    cause: Option<EventId>,
    payload: &CompensationPayload,
) -> Result<DomainEvent> {
    Ok(DomainEvent::builder(event_type)
        .aggregate_id(payload.saga_id)
        .correlation_id(correlation_id)
        .causation_id(cause)
        .payload(payload)?
        .source(COMPENSATION_SOURCE)
        .build()?)
}

/// Publishes `event`, logging instead of failing when the bus refuses it.
///
/// Returns the event id on success so callers can chain causation.
pub(crate) async fn publish_logged(
    publisher: &dyn EventPublisher,
    event: &DomainEvent,
) -> Option<EventId> {
    match publisher.publish(event).await {
        Ok(()) => Some(event.event_id),
        Err(e) => {
            tracing::error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                error = %e,
                "event could not be published"
            );
            metrics::counter!("saga_events_unpublished_total").increment(1);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::SagaStep;

    #[test]
    fn sale_event_uses_saga_id_as_correlation() {
        let mut saga =
            SagaExecution::new(SagaId::new(), "C1", "P1", 2, Money::from_cents(5000)).unwrap();
        saga.complete_step(SagaStep::VerifyStock).unwrap();

        let event = sale_event(EventType::SaleStockVerified, &saga, None).unwrap();
        assert_eq!(event.aggregate_type, "Sale");
        assert_eq!(event.correlation_id, saga.saga_id().to_string());
        assert_eq!(event.routing_key(), "sale.sale.stock.verified");
        assert_eq!(event.source(), Some(ORCHESTRATOR_SOURCE));

        let payload: SalePayload = event.payload_as().unwrap();
        assert_eq!(payload.state.as_deref(), Some("STOCK_VERIFIED"));
        assert_eq!(payload.amount_cents, Money::from_cents(5000));
    }

    #[test]
    fn follow_up_continues_the_chain() {
        let payload = SalePayload::new(SagaId::new(), "C1", "P1", 1, Money::from_cents(100));
        let created = transaction_created(&payload, "corr-9", None).unwrap();
        let paid = follow_up(
            EventType::PaymentProcessed,
            &created,
            &payload.clone().with_transaction_id("T1"),
            "payment-service",
        )
        .unwrap();

        assert_eq!(paid.aggregate_type, "Payment");
        assert_eq!(paid.correlation_id, "corr-9");
        assert_eq!(paid.causation_id, Some(created.event_id));
        let decoded: SalePayload = paid.payload_as().unwrap();
        assert_eq!(decoded.transaction_id.as_deref(), Some("T1"));
        assert!(decoded.reason.is_none());
    }

    #[test]
    fn fulfillment_failure_is_emitted_by_order() {
        let payload = SalePayload::new(SagaId::new(), "C1", "P1", 1, Money::from_cents(100));
        let created = transaction_created(&payload, "corr-1", None).unwrap();
        let failed = follow_up(order_fulfillment_failed(), &created, &payload, "order-service").unwrap();
        assert_eq!(failed.aggregate_type, "Order");
        assert_eq!(failed.routing_key(), "order.order.fulfillment.failed");
    }
}
