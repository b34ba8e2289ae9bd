//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use common::{Money, SagaId};

use super::{Fault, apply_fault};
use crate::error::{Result, SagaError};

const SERVICE: &str = "payment-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Processed,
    Failed,
    Refunded,
}

/// Outcome of a successful payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub transaction_id: String,
    pub status: PaymentStatus,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges the customer once per saga. A repeated call for a saga that
    /// already paid returns the original receipt.
    async fn process_payment(
        &self,
        customer_id: &str,
        amount: Money,
        saga_id: SagaId,
    ) -> Result<PaymentReceipt>;

    /// Refunds the saga's payment. Returns the refunded transaction id, or
    /// `None` if there was nothing to refund.
    async fn refund_payment(&self, saga_id: SagaId) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct PaymentRecord {
    transaction_id: String,
    amount: Money,
    status: PaymentStatus,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<SagaId, PaymentRecord>,
    next_id: u32,
    decline_above: Option<Money>,
    process_fault: Fault,
    refund_fault: Fault,
    process_calls: u32,
    refund_calls: u32,
}

/// In-memory payment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every payment while set.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.state().process_fault.reject = fail.then(|| "Payment declined".to_string());
    }

    /// Declines payments larger than `limit`.
    pub fn set_decline_above(&self, limit: Option<Money>) {
        self.state().decline_above = limit;
    }

    pub fn set_charge_unavailable_for(&self, calls: u32) {
        self.state().process_fault.unavailable_for = calls;
    }

    pub fn set_charge_delay(&self, delay: Option<std::time::Duration>) {
        self.state().process_fault.delay = delay;
    }

    pub fn set_refund_unavailable_for(&self, calls: u32) {
        self.state().refund_fault.unavailable_for = calls;
    }

    pub fn process_calls(&self) -> u32 {
        self.state().process_calls
    }

    pub fn refund_calls(&self) -> u32 {
        self.state().refund_calls
    }

    /// Number of payments currently captured.
    pub fn processed_count(&self) -> usize {
        self.state()
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Processed)
            .count()
    }

    pub fn status_for(&self, saga_id: SagaId) -> Option<PaymentStatus> {
        self.state().payments.get(&saga_id).map(|p| p.status)
    }

    pub fn amount_for(&self, saga_id: SagaId) -> Option<Money> {
        self.state().payments.get(&saga_id).map(|p| p.amount)
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn process_payment(
        &self,
        customer_id: &str,
        amount: Money,
        saga_id: SagaId,
    ) -> Result<PaymentReceipt> {
        let tripped = {
            let mut state = self.state();
            state.process_calls += 1;
            state.process_fault.trip(SERVICE)
        };
        apply_fault(tripped).await?;

        let mut state = self.state();
        if let Some(existing) = state.payments.get(&saga_id)
            && existing.status == PaymentStatus::Processed
        {
            return Ok(PaymentReceipt {
                transaction_id: existing.transaction_id.clone(),
                status: existing.status,
            });
        }

        state.next_id += 1;
        let transaction_id = format!("T{}", state.next_id);
        let declined = state.decline_above.is_some_and(|limit| amount > limit);
        let status = if declined {
            PaymentStatus::Failed
        } else {
            PaymentStatus::Processed
        };
        state.payments.insert(
            saga_id,
            PaymentRecord {
                transaction_id: transaction_id.clone(),
                amount,
                status,
            },
        );

        if declined {
            return Err(SagaError::rejected(
                SERVICE,
                format!("Payment of {amount} declined for customer {customer_id}"),
            ));
        }
        Ok(PaymentReceipt {
            transaction_id,
            status,
        })
    }

    async fn refund_payment(&self, saga_id: SagaId) -> Result<Option<String>> {
        let tripped = {
            let mut state = self.state();
            state.refund_calls += 1;
            state.refund_fault.trip(SERVICE)
        };
        apply_fault(tripped).await?;

        let mut state = self.state();
        match state.payments.get_mut(&saga_id) {
            Some(payment) if payment.status == PaymentStatus::Processed => {
                payment.status = PaymentStatus::Refunded;
                Ok(Some(payment.transaction_id.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn payment_is_deduped_by_saga() {
        let service = InMemoryPaymentService::new();
        let saga_id = SagaId::new();

        let first = service
            .process_payment("C1", Money::from_cents(5000), saga_id)
            .await
            .unwrap();
        let again = service
            .process_payment("C1", Money::from_cents(5000), saga_id)
            .await
            .unwrap();
        assert_eq!(first.transaction_id, "T1");
        assert_eq!(first, again);
        assert_eq!(service.processed_count(), 1);
    }

    #[tokio::test]
    async fn refund_is_idempotent() {
        let service = InMemoryPaymentService::new();
        let saga_id = SagaId::new();
        service
            .process_payment("C1", Money::from_cents(100), saga_id)
            .await
            .unwrap();

        assert_eq!(
            service.refund_payment(saga_id).await.unwrap(),
            Some("T1".into())
        );
        assert_eq!(service.refund_payment(saga_id).await.unwrap(), None);
        assert_eq!(service.status_for(saga_id), Some(PaymentStatus::Refunded));
    }

    #[tokio::test]
    async fn decline_limit() {
        let service = InMemoryPaymentService::new();
        service.set_decline_above(Some(Money::from_cents(1000)));
        let saga_id = SagaId::new();
        let err = service
            .process_payment("C1", Money::from_cents(1001), saga_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::BusinessRejected { .. }));
        assert_eq!(service.status_for(saga_id), Some(PaymentStatus::Failed));
        assert_eq!(service.refund_payment(saga_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fail_on_charge_toggle() {
        let service = InMemoryPaymentService::new();
        service.set_fail_on_charge(true);
        assert!(
            service
                .process_payment("C1", Money::from_cents(1), SagaId::new())
                .await
                .is_err()
        );
        assert_eq!(service.processed_count(), 0);
    }
}
